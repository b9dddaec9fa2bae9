//! TileForge intermediate representation: compute graphs and loop-nest schedules.

pub mod builder;
pub mod dialect;
pub mod error;
pub mod schedule;

pub use builder::*;
pub use dialect::*;
pub use error::IrError;
pub use schedule::*;
