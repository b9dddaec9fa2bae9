//! One full assignment of the tunable schedule parameters.

use serde::{Deserialize, Serialize};
use std::fmt;
use tileforge_autotune::Choice;

pub type FactorChoice = Choice<Vec<usize>>;

/// Tunable parameters consumed by the schedule applier.
///
/// Split tuples are ordered outer to inner. Every component remembers the
/// move that produced it so feedback reaches the right transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Params {
    pub vectorize: Choice<usize>,
    pub spatial_factors: Vec<FactorChoice>,
    pub reduce_factors: Vec<FactorChoice>,
    pub last_factors: Vec<FactorChoice>,
    pub output_unroll_step: Choice<usize>,
    pub last_unroll_step: Choice<usize>,
}

/// Value-only view used as the deduplication key.
#[derive(Serialize)]
struct ParamValues<'a> {
    vectorize: usize,
    spatial_factors: Vec<&'a [usize]>,
    reduce_factors: Vec<&'a [usize]>,
    last_factors: Vec<&'a [usize]>,
    output_unroll_step: usize,
    last_unroll_step: usize,
}

impl Params {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Warps per block: product of the warp-level spatial factors.
    ///
    /// The warp level is the second-innermost factor of each tuple, which is
    /// index 1 for the default three-way split.
    pub fn warp_count(&self) -> usize {
        self.spatial_factors
            .iter()
            .map(|choice| {
                let level = choice.value.len().checked_sub(2);
                level.and_then(|index| choice.value.get(index)).copied().unwrap_or(1)
            })
            .product()
    }

    /// Warp-level factor of the trailing operation: the innermost factor.
    pub fn last_warp_count(&self) -> usize {
        self.last_factors
            .iter()
            .map(|choice| choice.value.last().copied().unwrap_or(1))
            .product()
    }

    /// Both warp-capacity constraints hold for `warp_size`.
    pub fn fits_warp(&self, warp_size: usize) -> bool {
        self.warp_count() <= warp_size && self.last_warp_count() <= warp_size
    }

    fn values(&self) -> ParamValues<'_> {
        ParamValues {
            vectorize: self.vectorize.value,
            spatial_factors: factor_values(&self.spatial_factors),
            reduce_factors: factor_values(&self.reduce_factors),
            last_factors: factor_values(&self.last_factors),
            output_unroll_step: self.output_unroll_step.value,
            last_unroll_step: self.last_unroll_step.value,
        }
    }
}

fn factor_values(choices: &[FactorChoice]) -> Vec<&[usize]> {
    choices.iter().map(|choice| choice.value.as_slice()).collect()
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(&self.values()).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Params {
        Params {
            vectorize: Choice::new(8, vec![0]),
            spatial_factors: vec![
                Choice::new(vec![1, 4, 1], vec![0, 0]),
                Choice::new(vec![2, 2, 1], vec![1, -1]),
            ],
            reduce_factors: vec![Choice::new(vec![2, 2, 2], vec![0, 1])],
            last_factors: vec![Choice::new(vec![256, 16], vec![1])],
            output_unroll_step: Choice::new(512, vec![1]),
            last_unroll_step: Choice::new(16, vec![0]),
        }
    }

    #[test]
    fn test_json_round_trip() {
        let params = sample();
        let json = params.to_json().unwrap();
        assert_eq!(Params::from_json(&json).unwrap(), params);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        for key in [
            "vectorize",
            "spatial_factors",
            "reduce_factors",
            "last_factors",
            "output_unroll_step",
            "last_unroll_step",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
    }

    #[test]
    fn test_display_ignores_directions() {
        let params = sample();
        let mut moved = params.clone();
        moved.vectorize.direction = vec![1];
        moved.spatial_factors[0].direction = vec![-1, -1];
        assert_eq!(params.to_string(), moved.to_string());
        assert_eq!(
            params.to_string(),
            r#"{"vectorize":8,"spatial_factors":[[1,4,1],[2,2,1]],"reduce_factors":[[2,2,2]],"last_factors":[[256,16]],"output_unroll_step":512,"last_unroll_step":16}"#
        );
    }

    #[test]
    fn test_warp_constraints() {
        let mut params = sample();
        assert_eq!(params.warp_count(), 8);
        assert_eq!(params.last_warp_count(), 16);
        assert!(params.fits_warp(32));
        params.last_factors[0].value = vec![64, 64];
        assert!(!params.fits_warp(32));
    }
}
