//! Schedule search and application for tensorized operators.
//!
//! [`ScheduleGenerator`] proposes [`Params`] for a graph whose main operation
//! was matched against an intrinsic recipe, and [`ScheduleApplier`] turns a
//! parameter set into loop transformations on a [`tileforge_ir::Schedule`].

pub mod applier;
pub mod config;
pub mod context;
pub mod error;
pub mod generator;
pub mod params;
pub mod state;

#[cfg(test)]
mod testing;

pub use applier::{primitive_stages, PrimitiveStage, ScheduleApplier, UNROLL_PRAGMA};
pub use config::*;
pub use context::*;
pub use error::ScheduleError;
pub use generator::ScheduleGenerator;
pub use params::*;
pub use state::SchedulingState;
