//! Error type shared by graph construction and schedule primitives.

use crate::dialect::OpId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IrError {
    #[error("operation `{name}` has an empty name or duplicates an existing one")]
    InvalidName { name: String },

    #[error("operation `{op}` reads unknown operation {input}")]
    UnknownInput { op: String, input: OpId },

    #[error("axis `{axis}` of operation `{op}` has zero extent")]
    ZeroExtent { op: String, axis: String },

    #[error("operation {0} is not part of the graph")]
    UnknownOp(OpId),

    #[error("placeholder `{0}` cannot be replaced by a splice")]
    SpliceOnPlaceholder(String),

    #[error("splice replacement is empty")]
    EmptySplice,

    #[error("splice template {index} references a later template {target}")]
    ForwardTemplate { index: usize, target: usize },

    #[error("unknown stage {0}")]
    UnknownStage(usize),

    #[error("no stage was created for operation {0}")]
    NoStageForOp(OpId),

    #[error("iteration variable {axis} is not a leaf axis of stage `{stage}`")]
    NotALeaf { stage: String, axis: usize },

    #[error("cannot fuse non-adjacent axes of stage `{stage}`")]
    NonAdjacentFuse { stage: String },

    #[error("axis {axis} listed twice in reorder of stage `{stage}`")]
    DuplicateAxis { stage: String, axis: usize },

    #[error("split factor must be positive (stage `{stage}`)")]
    ZeroFactor { stage: String },

    #[error("stage `{stage}` cannot be attached to itself")]
    SelfAttach { stage: String },
}
