//! Recipe building blocks: roles, capsules, reserved axes and intrinsic keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role an operation of the spliced intrinsic sub-graph plays while scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationRole {
    Load,
    Main,
    Output,
}

/// Granularity at which a hardware instruction executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstructionScope {
    Thread,
    Warp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapsuleKind {
    Load,
    Compute,
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapsuleInput {
    /// The n-th input of the matched main operation.
    External(usize),
    /// Output of another capsule of the same recipe.
    Capsule(String),
}

/// One node of a recipe's internal sub-graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleSpec {
    pub name: String,
    pub kind: CapsuleKind,
    pub reads: Vec<CapsuleInput>,
}

impl CapsuleSpec {
    pub fn load<N: Into<String>>(name: N, input: usize) -> Self {
        Self {
            name: name.into(),
            kind: CapsuleKind::Load,
            reads: vec![CapsuleInput::External(input)],
        }
    }

    pub fn compute<N: Into<String>>(name: N, reads: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind: CapsuleKind::Compute,
            reads: reads
                .iter()
                .map(|read| CapsuleInput::Capsule(read.to_string()))
                .collect(),
        }
    }

    pub fn store<N: Into<String>>(name: N, read: &str) -> Self {
        Self {
            name: name.into(),
            kind: CapsuleKind::Store,
            reads: vec![CapsuleInput::Capsule(read.to_string())],
        }
    }

    /// Names of the capsules this capsule reads.
    pub fn capsule_reads(&self) -> impl Iterator<Item = &str> + '_ {
        self.reads.iter().filter_map(|read| match read {
            CapsuleInput::Capsule(name) => Some(name.as_str()),
            CapsuleInput::External(_) => None,
        })
    }
}

/// Innermost axis extents a capsule keeps for the hardware instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveAxes {
    pub spatial: Vec<usize>,
    pub reduce: Vec<usize>,
}

impl ReserveAxes {
    pub fn new(spatial: &[usize], reduce: &[usize]) -> Self {
        Self {
            spatial: spatial.to_vec(),
            reduce: reduce.to_vec(),
        }
    }
}

/// Lookup key for per-capsule recipe data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntrinsicKey {
    pub compute_key: String,
    pub shape_key: String,
    pub capsule: String,
}

impl IntrinsicKey {
    pub fn new(compute_key: &str, shape_key: &str, capsule: &str) -> Self {
        Self {
            compute_key: compute_key.to_string(),
            shape_key: shape_key.to_string(),
            capsule: capsule.to_string(),
        }
    }
}

impl fmt::Display for IntrinsicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.compute_key, self.shape_key, self.capsule)
    }
}

/// Opaque handle naming a hardware intrinsic the code generator understands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Intrinsic {
    pub name: String,
}

impl Intrinsic {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self { name: name.into() }
    }
}
