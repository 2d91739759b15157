//! Engine tunables
//!
//! Everything here has a sensible default; an optional `config.json` in
//! the output directory overrides defaults, and explicit command line
//! flags override both.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration settings for the fuzzing engine
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Largest sample the engine will mutate or deliver
    #[serde(default = "default_max_sample_size")]
    pub max_sample_size: usize,

    /// How often a federated engine polls the server for corpus updates
    #[serde(default = "default_server_update_interval")]
    pub server_update_interval: Duration,

    /// How often the engine checkpoints its state while fuzzing
    #[serde(default = "default_save_interval")]
    pub save_interval: Duration,

    /// Hangs tolerated per run before an entry is discarded
    #[serde(default = "default_acceptable_hang_ratio")]
    pub acceptable_hang_ratio: f64,

    /// Crashes tolerated per run before an entry is discarded
    #[serde(default = "default_acceptable_crash_ratio")]
    pub acceptable_crash_ratio: f64,

    /// Reruns used to separate stable from variable coverage
    #[serde(default = "default_coverage_reproduce_retries")]
    pub coverage_reproduce_retries: usize,

    /// Reruns used to confirm a crash before naming it
    #[serde(default = "default_crash_reproduce_retries")]
    pub crash_reproduce_retries: usize,

    /// Crash files kept per unique crash description
    #[serde(default = "default_max_identical_crashes")]
    pub max_identical_crashes: usize,

    /// Sample delivery retries against a cleaned target before the
    /// failure is fatal
    #[serde(default = "default_delivery_retry_times")]
    pub delivery_retry_times: usize,

    /// Queue size that ends the generation phase
    #[serde(default = "default_min_samples_to_generate")]
    pub min_samples_to_generate: usize,

    /// Mutations tried per fuzz job
    #[serde(default = "default_iterations_per_round")]
    pub iterations_per_round: usize,

    /// Node count where grammar minimization stops
    #[serde(default = "default_grammar_minimization_limit")]
    pub grammar_minimization_limit: usize,
}

const fn default_max_sample_size() -> usize {
    1_000_000
}

const fn default_server_update_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

const fn default_save_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

const fn default_acceptable_hang_ratio() -> f64 {
    0.01
}

const fn default_acceptable_crash_ratio() -> f64 {
    0.02
}

const fn default_coverage_reproduce_retries() -> usize {
    3
}

const fn default_crash_reproduce_retries() -> usize {
    10
}

const fn default_max_identical_crashes() -> usize {
    4
}

const fn default_delivery_retry_times() -> usize {
    100
}

const fn default_min_samples_to_generate() -> usize {
    10
}

const fn default_iterations_per_round() -> usize {
    1000
}

const fn default_grammar_minimization_limit() -> usize {
    100
}

impl std::default::Default for Config {
    fn default() -> Self {
        Self {
            max_sample_size: default_max_sample_size(),
            server_update_interval: default_server_update_interval(),
            save_interval: default_save_interval(),
            acceptable_hang_ratio: default_acceptable_hang_ratio(),
            acceptable_crash_ratio: default_acceptable_crash_ratio(),
            coverage_reproduce_retries: default_coverage_reproduce_retries(),
            crash_reproduce_retries: default_crash_reproduce_retries(),
            max_identical_crashes: default_max_identical_crashes(),
            delivery_retry_times: default_delivery_retry_times(),
            min_samples_to_generate: default_min_samples_to_generate(),
            iterations_per_round: default_iterations_per_round(),
            grammar_minimization_limit: default_grammar_minimization_limit(),
        }
    }
}

impl Config {
    /// Load `config.json` from the output directory if present, else the
    /// defaults
    pub fn from_output_dir(out_dir: &Path) -> Result<Self> {
        let config_file = out_dir.join("config.json");
        if !config_file.exists() {
            return Ok(Config::default());
        }
        let data = std::fs::read_to_string(&config_file)
            .with_context(|| format!("Failed to read {config_file:?}"))?;
        serde_json::from_str(&data).with_context(|| format!("Failed to parse {config_file:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_constants() {
        let config = Config::default();
        assert_eq!(config.max_sample_size, 1_000_000);
        assert_eq!(config.coverage_reproduce_retries, 3);
        assert_eq!(config.crash_reproduce_retries, 10);
        assert_eq!(config.max_identical_crashes, 4);
        assert_eq!(config.min_samples_to_generate, 10);
        assert_eq!(config.acceptable_hang_ratio, 0.01);
        assert_eq!(config.acceptable_crash_ratio, 0.02);
    }

    #[test]
    fn partial_json_keeps_defaults_for_the_rest() {
        let config: Config = serde_json::from_str(r#"{"max_sample_size": 4096}"#).unwrap();
        assert_eq!(config.max_sample_size, 4096);
        assert_eq!(config.coverage_reproduce_retries, 3);
    }
}
