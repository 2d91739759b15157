//! Coverage sets and their algebra
//!
//! Coverage is an ordered sequence of (module, offset-set) pairs. The
//! scheduler and the federation server both reason about novelty through
//! the same three operations: union, difference, and containment. The
//! empty coverage is the identity under [`Coverage::merge`].

use std::collections::BTreeSet;
use std::io::{Read, Write};

use anyhow::Result;

use crate::utils::{read_string, read_u64, write_string, write_u64};

/// The offsets recorded for a single instrumented module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleCoverage {
    /// Module name, unique within one [`Coverage`]
    pub module_name: String,

    /// Instrumentation offsets observed in this module
    pub offsets: BTreeSet<u64>,
}

/// A set of (module, offset) pairs recorded by the target instrumentation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Coverage {
    /// Per-module offset sets, in first-seen module order
    pub modules: Vec<ModuleCoverage>,
}

impl Coverage {
    /// Create an empty coverage set
    #[must_use]
    pub fn new() -> Self {
        Coverage::default()
    }

    /// True when no module has any offsets
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.iter().all(|m| m.offsets.is_empty())
    }

    /// Total number of offsets across all modules
    #[must_use]
    pub fn num_offsets(&self) -> usize {
        self.modules.iter().map(|m| m.offsets.len()).sum()
    }

    /// The coverage recorded for `name`, if any
    #[must_use]
    pub fn module(&self, name: &str) -> Option<&ModuleCoverage> {
        self.modules.iter().find(|m| m.module_name == name)
    }

    /// The coverage recorded for `name`, creating an empty entry if needed
    pub fn module_mut(&mut self, name: &str) -> &mut ModuleCoverage {
        if let Some(index) = self.modules.iter().position(|m| m.module_name == name) {
            return &mut self.modules[index];
        }
        self.modules.push(ModuleCoverage {
            module_name: name.to_string(),
            offsets: BTreeSet::new(),
        });
        self.modules.last_mut().unwrap()
    }

    /// Record a single offset
    pub fn insert(&mut self, module: &str, offset: u64) {
        self.module_mut(module).offsets.insert(offset);
    }

    /// Union `src` into `self`
    pub fn merge(&mut self, src: &Coverage) {
        for module in &src.modules {
            if module.offsets.is_empty() {
                continue;
            }
            let ours = self.module_mut(&module.module_name);
            ours.offsets.extend(module.offsets.iter().copied());
        }
    }

    /// The offsets of `newer` that are not already in `self`
    #[must_use]
    pub fn difference(&self, newer: &Coverage) -> Coverage {
        let mut out = Coverage::new();
        for module in &newer.modules {
            let fresh: BTreeSet<u64> = match self.module(&module.module_name) {
                Some(known) => module.offsets.difference(&known.offsets).copied().collect(),
                None => module.offsets.clone(),
            };
            if !fresh.is_empty() {
                out.modules.push(ModuleCoverage {
                    module_name: module.module_name.clone(),
                    offsets: fresh,
                });
            }
        }
        out
    }

    /// The offsets present in both `self` and `other`
    #[must_use]
    pub fn intersection(&self, other: &Coverage) -> Coverage {
        let mut out = Coverage::new();
        for module in &self.modules {
            if let Some(theirs) = other.module(&module.module_name) {
                let shared: BTreeSet<u64> =
                    module.offsets.intersection(&theirs.offsets).copied().collect();
                if !shared.is_empty() {
                    out.modules.push(ModuleCoverage {
                        module_name: module.module_name.clone(),
                        offsets: shared,
                    });
                }
            }
        }
        out
    }

    /// True when every offset of `other` is already in `self`
    #[must_use]
    pub fn contains(&self, other: &Coverage) -> bool {
        self.difference(other).is_empty()
    }

    /// Serialize as `[num_modules:u64] (name_len:u64, name, num_offsets:u64,
    /// offsets[num_offsets]:u64)*`, all little-endian
    pub fn write_binary<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u64(w, self.modules.len() as u64)?;
        for module in &self.modules {
            write_string(w, &module.module_name)?;
            write_u64(w, module.offsets.len() as u64)?;
            for offset in &module.offsets {
                write_u64(w, *offset)?;
            }
        }
        Ok(())
    }

    /// Deserialize the format written by [`Coverage::write_binary`]
    pub fn read_binary<R: Read>(r: &mut R) -> Result<Coverage> {
        let mut coverage = Coverage::new();
        let num_modules = read_u64(r)?;
        for _ in 0..num_modules {
            let module_name = read_string(r)?;
            let num_offsets = read_u64(r)?;
            let module = coverage.module_mut(&module_name);
            for _ in 0..num_offsets {
                let offset = read_u64(r)?;
                module.offsets.insert(offset);
            }
        }
        Ok(coverage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn cov(entries: &[(&str, &[u64])]) -> Coverage {
        let mut coverage = Coverage::new();
        for (module, offsets) in entries {
            for offset in *offsets {
                coverage.insert(module, *offset);
            }
        }
        coverage
    }

    #[test]
    fn merge_is_commutative_and_idempotent() {
        let a = cov(&[("t", &[1, 2]), ("u", &[7])]);
        let b = cov(&[("t", &[2, 3])]);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab.num_offsets(), 4);
        assert!(ab.contains(&ba) && ba.contains(&ab));

        let mut aa = a.clone();
        aa.merge(&a);
        assert_eq!(aa, a);
    }

    #[test]
    fn difference_of_merge_recovers_new_offsets() {
        let a = cov(&[("t", &[1, 2])]);
        let b = cov(&[("t", &[2, 3]), ("u", &[9])]);

        let mut merged = a.clone();
        merged.merge(&b);

        // difference(a, merge(a, b)) == b \ a
        let expected = a.difference(&b);
        assert_eq!(a.difference(&merged), expected);
        assert_eq!(expected, cov(&[("t", &[3]), ("u", &[9])]));
    }

    #[test]
    fn contains_iff_difference_empty() {
        let a = cov(&[("t", &[1, 2, 3])]);
        let sub = cov(&[("t", &[2])]);
        let not_sub = cov(&[("t", &[2]), ("u", &[1])]);

        assert!(a.contains(&sub));
        assert!(a.difference(&sub).is_empty());
        assert!(!a.contains(&not_sub));
        assert!(!a.difference(&not_sub).is_empty());
    }

    #[test]
    fn intersection_keeps_shared_offsets() {
        let a = cov(&[("t", &[1, 2, 3]), ("u", &[5])]);
        let b = cov(&[("t", &[2, 3, 4]), ("v", &[5])]);
        assert_eq!(a.intersection(&b), cov(&[("t", &[2, 3])]));
    }

    #[test]
    fn empty_coverage_is_merge_identity() {
        let a = cov(&[("t", &[42])]);
        let mut merged = Coverage::new();
        merged.merge(&a);
        assert_eq!(merged, a);

        let mut copy = a.clone();
        copy.merge(&Coverage::new());
        assert_eq!(copy, a);
    }

    #[test]
    fn binary_roundtrip() {
        let a = cov(&[("target.so", &[0x1000, 0x2000]), ("lib.so", &[7])]);
        let mut buf = Vec::new();
        a.write_binary(&mut buf).unwrap();
        let restored = Coverage::read_binary(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(restored, a);
    }
}
