use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecipeError {
    #[error("recipe `{recipe}` has no capsule named `{capsule}`")]
    UnknownCapsule { recipe: String, capsule: String },

    #[error("recipe `{recipe}` has no intrinsic for ({compute_key}, {shape_key}, {capsule})")]
    UnknownIntrinsic {
        recipe: String,
        compute_key: String,
        shape_key: String,
        capsule: String,
    },

    #[error("recipe `{recipe}` does not support shape key `{shape_key}`")]
    UnknownShapeKey { recipe: String, shape_key: String },

    #[error("unsupported target `{0}`; only `cuda` is schedulable")]
    UnsupportedTarget(String),

    #[error("recipe `{recipe}` is malformed: {reason}")]
    Malformed { recipe: String, reason: String },

    #[error("operation `{op}` does not match recipe `{recipe}`: {reason}")]
    ShapeMismatch {
        recipe: String,
        op: String,
        reason: String,
    },
}
