//! Structural errors raised while preparing or applying a schedule.

use thiserror::Error;
use tileforge_autotune::SearchError;
use tileforge_intrinsics::{OperationRole, RecipeError};
use tileforge_ir::{IrError, OpId};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Ir(#[from] IrError),

    #[error(transparent)]
    Recipe(#[from] RecipeError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("main operation {0} is not part of the graph")]
    MissingMainOp(OpId),

    #[error("main operation `{0}` is not a compute operation")]
    MainNotCompute(String),

    #[error("operation `{0}` has reduction axes; only the main operation may reduce")]
    ExtraReduction(String),

    #[error("no operation carries the {0:?} role")]
    MissingRole(OperationRole),

    #[error("more than one operation carries the {0:?} role")]
    DuplicateRole(OperationRole),

    #[error("output operation must come after the main operation")]
    OutputBeforeMain,

    #[error("`{op}` was split into {levels} tile levels; at least 4 are required")]
    NotEnoughTileLevels { op: String, levels: usize },

    #[error("`{0}` has no reserved axes")]
    NoReservedAxes(String),

    #[error("`{op}` reserves {reserved} axes but only has {rank}")]
    ReservedAxesExceedRank {
        op: String,
        reserved: usize,
        rank: usize,
    },

    #[error("operation `{0}` qualifies for both the load and the trailing cache read")]
    AmbiguousCacheRead(String),

    #[error("the main operation was tiled before the output operation")]
    OutputNotTiled,

    #[error("{op} tile level {level} is missing")]
    MissingTileLevel { op: &'static str, level: &'static str },

    #[error("invalid generator config: {0}")]
    InvalidConfig(String),

    #[error("params do not match the schedule: {0}")]
    ParamsMismatch(String),

    #[error("no intrinsic bind axis recorded for `{0}`")]
    MissingBindAxis(String),

    #[error("no candidate params could be generated")]
    NoCandidate,
}
