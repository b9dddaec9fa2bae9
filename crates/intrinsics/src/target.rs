//! Accelerator target descriptions.

use crate::error::RecipeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tileforge_ir::DataType;

/// Width in bits of the widest vector load the target issues per thread.
const CUDA_VECTOR_BITS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    Cuda,
}

impl Target {
    pub fn warp_size(&self) -> usize {
        match self {
            Target::Cuda => 32,
        }
    }

    /// Maximum number of `dtype` elements one vectorized access moves.
    pub fn max_vector_length(&self, dtype: DataType) -> usize {
        match self {
            Target::Cuda => (CUDA_VECTOR_BITS / dtype.bits()).max(1),
        }
    }
}

impl FromStr for Target {
    type Err = RecipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cuda" => Ok(Target::Cuda),
            other => Err(RecipeError::UnsupportedTarget(other.to_string())),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Cuda => f.write_str("cuda"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert_eq!("cuda".parse::<Target>().unwrap(), Target::Cuda);
        assert_eq!(
            "opencl".parse::<Target>(),
            Err(RecipeError::UnsupportedTarget("opencl".into()))
        );
    }

    #[test]
    fn test_vector_length_by_dtype() {
        assert_eq!(Target::Cuda.max_vector_length(DataType::F16), 8);
        assert_eq!(Target::Cuda.max_vector_length(DataType::F32), 4);
        assert_eq!(Target::Cuda.max_vector_length(DataType::I8), 16);
        assert_eq!(Target::Cuda.warp_size(), 32);
    }
}
