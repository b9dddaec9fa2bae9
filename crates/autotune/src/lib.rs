//! Target-independent search machinery for TileForge: factor enumeration,
//! Q-learning parameter generators, the search archive and the tuning log.

pub mod archive;
pub mod cache;
pub mod error;
pub mod factors;
pub mod generator;

pub use archive::*;
pub use cache::*;
pub use error::SearchError;
pub use factors::*;
pub use generator::*;
