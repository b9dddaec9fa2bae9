//! Search and application settings.

use serde::{Deserialize, Serialize};
use tileforge_autotune::{DEFAULT_ARCHIVE_CAPACITY, DEFAULT_EXPLORE, DEFAULT_TOP_K};
use tileforge_ir::ThreadTokens;

pub const DEFAULT_UNROLL_STEPS: [usize; 4] = [16, 64, 512, 1500];
pub const DEFAULT_WARP_SIZE: usize = 32;

/// Settings of the schedule search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Probability of a fully random candidate under the `q` policy.
    pub eps: f64,
    /// Probability that a single parameter generator tries a random move.
    pub explore: f64,
    /// Number of archived records annealing selection draws from.
    pub top_k: usize,
    pub archive_capacity: usize,
    pub seed: u64,
    pub spatial_parts: usize,
    pub reduce_parts: usize,
    pub last_parts: usize,
    pub unroll_steps: Vec<usize>,
    pub warp_size: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            eps: 0.1,
            explore: DEFAULT_EXPLORE,
            top_k: DEFAULT_TOP_K,
            archive_capacity: DEFAULT_ARCHIVE_CAPACITY,
            seed: 0,
            spatial_parts: 3,
            reduce_parts: 3,
            last_parts: 2,
            unroll_steps: DEFAULT_UNROLL_STEPS.to_vec(),
            warp_size: DEFAULT_WARP_SIZE,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.eps) || !(0.0..=1.0).contains(&self.explore) {
            return Err("eps and explore must be probabilities".into());
        }
        if self.top_k == 0 || self.archive_capacity == 0 {
            return Err("top_k and archive_capacity must be > 0".into());
        }
        // Output and main tiling need at least four levels including the
        // reserved one; the trailing op needs a warp level at index 1.
        if self.spatial_parts < 3 || self.reduce_parts < 3 || self.last_parts < 2 {
            return Err("spatial/reduce parts must be >= 3 and last parts >= 2".into());
        }
        if self.unroll_steps.is_empty() {
            return Err("unroll step menu is empty".into());
        }
        if self.warp_size == 0 {
            return Err("warp size must be > 0".into());
        }
        Ok(())
    }
}

/// Settings of the schedule applier.
///
/// The warp size is not configured here: an applier is built from its
/// generator and tiles with the generator's warp size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplierConfig {
    pub tokens: ThreadTokens,
    /// Stage operations feeding only the trailing op through shared memory.
    pub cache_read_for_last: bool,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            tokens: ThreadTokens::cuda(),
            cache_read_for_last: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(GeneratorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = GeneratorConfig::default();
        config.spatial_parts = 2;
        assert!(config.validate().is_err());

        config = GeneratorConfig::default();
        config.eps = 1.5;
        assert!(config.validate().is_err());

        config = GeneratorConfig::default();
        config.unroll_steps.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: GeneratorConfig = serde_json::from_str(r#"{"seed": 9, "top_k": 5}"#).unwrap();
        assert_eq!(config.seed, 9);
        assert_eq!(config.top_k, 5);
        assert_eq!(config.unroll_steps, DEFAULT_UNROLL_STEPS.to_vec());

        let applier: ApplierConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(applier, ApplierConfig::default());
    }
}
