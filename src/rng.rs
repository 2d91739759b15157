//! MT19937 pseudo random number generator seeded from the OS entropy source
//!
//! Each worker thread owns its own generator; nothing here is shared.
//!
//! ```test
//! Reference: Matsumoto & Nishimura, "Mersenne Twister: A 623-dimensionally
//! equidistributed uniform pseudorandom number generator" (mt19937ar)
//! ```

use rand::rngs::OsRng;
use rand::{RngCore, SeedableRng};

/// Degree of recurrence of the MT19937 state
const N: usize = 624;

/// Middle word offset
const M: usize = 397;

/// Constant vector a
const MATRIX_A: u32 = 0x9908_b0df;

/// Most significant w-r bits
const UPPER_MASK: u32 = 0x8000_0000;

/// Least significant r bits
const LOWER_MASK: u32 = 0x7fff_ffff;

/// Random draws used by the engine and the mutators.
///
/// Implementations only need a uniform `u32` source; the ranged and real
/// draws are derived from it so every implementation produces the same
/// mutation distributions.
pub trait Prng {
    /// Generate a random number on the `[0, 0xffffffff]` interval
    fn rand_u32(&mut self) -> u32;

    /// Generate a random number on the `[lo, hi]` inclusive interval
    fn rand_range(&mut self, lo: usize, hi: usize) -> usize {
        if lo >= hi {
            return lo;
        }
        lo + (self.rand_u32() as usize) % (hi - lo + 1)
    }

    /// Generate a random `u64`
    fn rand_u64(&mut self) -> u64 {
        (u64::from(self.rand_u32()) << 32) | u64::from(self.rand_u32())
    }

    /// Generate a random number on the `[0, 1]` real interval
    fn rand_real(&mut self) -> f64 {
        f64::from(self.rand_u32()) * (1.0 / 4_294_967_295.0)
    }
}

/// Fill `buf` from the OS entropy source
pub fn secure_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// MT19937 generator state
pub struct Mt19937 {
    /// State vector
    mt: [u32; N],

    /// Next word to temper
    mti: usize,
}

impl Mt19937 {
    /// Create a generator seeded with 128 bits from the OS entropy source
    #[must_use]
    pub fn new() -> Self {
        let mut seed = [0_u8; 16];
        secure_random(&mut seed);
        Self::from_seed(seed)
    }

    /// Initialize the state from a single `u32` seed
    fn init_genrand(&mut self, seed: u32) {
        self.mt[0] = seed;
        for i in 1..N {
            // See Knuth TAOCP Vol2. 3rd Ed. P.106 for the multiplier
            self.mt[i] = 1_812_433_253_u32
                .wrapping_mul(self.mt[i - 1] ^ (self.mt[i - 1] >> 30))
                .wrapping_add(i as u32);
        }
        self.mti = N;
    }

    /// Initialize the state from an array of seed words
    fn init_by_array(&mut self, key: &[u32]) {
        self.init_genrand(19_650_218);

        let mut i = 1_usize;
        let mut j = 0_usize;
        let mut k = N.max(key.len());

        while k > 0 {
            self.mt[i] = (self.mt[i]
                ^ (self.mt[i - 1] ^ (self.mt[i - 1] >> 30)).wrapping_mul(1_664_525))
            .wrapping_add(key[j])
            .wrapping_add(j as u32);
            i += 1;
            j += 1;
            if i >= N {
                self.mt[0] = self.mt[N - 1];
                i = 1;
            }
            if j >= key.len() {
                j = 0;
            }
            k -= 1;
        }

        k = N - 1;
        while k > 0 {
            self.mt[i] = (self.mt[i]
                ^ (self.mt[i - 1] ^ (self.mt[i - 1] >> 30)).wrapping_mul(1_566_083_941))
            .wrapping_sub(i as u32);
            i += 1;
            if i >= N {
                self.mt[0] = self.mt[N - 1];
                i = 1;
            }
            k -= 1;
        }

        // MSB is 1, assuring a non-zero initial state
        self.mt[0] = 0x8000_0000;
    }

    /// Regenerate the full state vector
    fn generate_words(&mut self) {
        for i in 0..N {
            let y = (self.mt[i] & UPPER_MASK) | (self.mt[(i + 1) % N] & LOWER_MASK);
            let mut next = self.mt[(i + M) % N] ^ (y >> 1);
            if y & 1 != 0 {
                next ^= MATRIX_A;
            }
            self.mt[i] = next;
        }
        self.mti = 0;
    }
}

impl Default for Mt19937 {
    fn default() -> Self {
        Mt19937::new()
    }
}

impl Prng for Mt19937 {
    fn rand_u32(&mut self) -> u32 {
        if self.mti >= N {
            self.generate_words();
        }

        let mut y = self.mt[self.mti];
        self.mti += 1;

        // Tempering
        y ^= y >> 11;
        y ^= (y << 7) & 0x9d2c_5680;
        y ^= (y << 15) & 0xefc6_0000;
        y ^= y >> 18;

        y
    }
}

impl RngCore for Mt19937 {
    fn next_u32(&mut self) -> u32 {
        self.rand_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rand_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand_core::impls::fill_bytes_via_next(self, dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for Mt19937 {
    type Seed = [u8; 16];

    fn from_seed(seed: Self::Seed) -> Self {
        let mut rng = Mt19937 {
            mt: [0; N],
            mti: N + 1,
        };

        let words = [
            u32::from_le_bytes(seed[0..4].try_into().unwrap()),
            u32::from_le_bytes(seed[4..8].try_into().unwrap()),
            u32::from_le_bytes(seed[8..12].try_into().unwrap()),
            u32::from_le_bytes(seed[12..16].try_into().unwrap()),
        ];
        rng.init_by_array(&words);

        rng
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector_from_reference_implementation() {
        // First outputs of mt19937ar's init_by_array with the reference
        // key {0x123, 0x234, 0x345, 0x456}
        let mut seed = [0_u8; 16];
        seed[0..4].copy_from_slice(&0x123_u32.to_le_bytes());
        seed[4..8].copy_from_slice(&0x234_u32.to_le_bytes());
        seed[8..12].copy_from_slice(&0x345_u32.to_le_bytes());
        seed[12..16].copy_from_slice(&0x456_u32.to_le_bytes());

        let mut rng = Mt19937::from_seed(seed);
        assert_eq!(rng.rand_u32(), 1_067_595_299);
        assert_eq!(rng.rand_u32(), 955_945_823);
        assert_eq!(rng.rand_u32(), 477_289_528);
        assert_eq!(rng.rand_u32(), 4_107_686_914);
    }

    #[test]
    fn rand_range_is_inclusive() {
        let mut rng = Mt19937::from_seed([7; 16]);
        let mut seen_lo = false;
        let mut seen_hi = false;
        for _ in 0..1000 {
            let v = rng.rand_range(3, 5);
            assert!((3..=5).contains(&v));
            seen_lo |= v == 3;
            seen_hi |= v == 5;
        }
        assert!(seen_lo && seen_hi);

        assert_eq!(rng.rand_range(9, 9), 9);
    }

    #[test]
    fn rand_real_in_unit_interval() {
        let mut rng = Mt19937::from_seed([1; 16]);
        for _ in 0..1000 {
            let r = rng.rand_real();
            assert!((0.0..=1.0).contains(&r));
        }
    }

    #[test]
    fn distinct_secure_seeds() {
        let mut a = Mt19937::new();
        let mut b = Mt19937::new();
        let va: Vec<u32> = (0..8).map(|_| a.rand_u32()).collect();
        let vb: Vec<u32> = (0..8).map(|_| b.rand_u32()).collect();
        assert_ne!(va, vb);
    }
}
