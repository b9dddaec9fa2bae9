//! Operation and tensor definitions for TileForge compute graphs.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DataType {
    F16,
    BF16,
    F32,
    F64,
    I8,
    I32,
}

impl DataType {
    pub fn element_type(&self) -> &'static str {
        match self {
            DataType::F16 => "float16",
            DataType::BF16 => "bfloat16",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
            DataType::I8 => "int8",
            DataType::I32 => "int32",
        }
    }

    pub fn bits(&self) -> usize {
        match self {
            DataType::I8 => 8,
            DataType::F16 | DataType::BF16 => 16,
            DataType::F32 | DataType::I32 => 32,
            DataType::F64 => 64,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.element_type())
    }
}

/// Stable handle of an operation inside a [`crate::ComputeGraph`] arena.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub usize);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// A loop axis with a known integer extent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AxisSpec {
    pub name: String,
    pub extent: usize,
}

impl AxisSpec {
    pub fn new<N: Into<String>>(name: N, extent: usize) -> Self {
        Self {
            name: name.into(),
            extent,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Graph input; carries a shape but no computation.
    Placeholder,
    /// Side-effect-free computation, optionally with reduction axes.
    Compute,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    pub id: OpId,
    pub name: String,
    pub kind: OpKind,
    pub axes: Vec<AxisSpec>,
    pub reduce_axes: Vec<AxisSpec>,
    pub inputs: Vec<OpId>,
    pub dtype: DataType,
}

impl Operation {
    pub fn is_compute(&self) -> bool {
        matches!(self.kind, OpKind::Compute)
    }

    pub fn has_reduction(&self) -> bool {
        !self.reduce_axes.is_empty()
    }

    /// Shape of the tensor this operation produces.
    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(|axis| axis.extent).collect()
    }

    /// Product of all spatial extents.
    pub fn flat_extent(&self) -> usize {
        self.axes.iter().map(|axis| axis.extent).product()
    }
}

/// Description of an operation that has not been inserted into a graph yet.
#[derive(Debug, Clone, PartialEq)]
pub struct OpTemplate {
    pub name: String,
    pub kind: OpKind,
    pub axes: Vec<AxisSpec>,
    pub reduce_axes: Vec<AxisSpec>,
    pub inputs: Vec<OpInput>,
    pub dtype: DataType,
}

/// Input reference used while splicing: an operation already in the graph,
/// or an earlier template of the same replacement sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpInput {
    Existing(OpId),
    Template(usize),
}
