//! Hardware intrinsic recipes, operation roles and target descriptions for TileForge.

pub mod config;
pub mod error;
pub mod recipe;
pub mod registry;
pub mod target;
pub mod wmma;

pub use config::*;
pub use error::RecipeError;
pub use recipe::*;
pub use registry::*;
pub use target::*;
pub use wmma::*;
