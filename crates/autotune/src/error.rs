use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("extent {extent} has no factorization into {parts} parts")]
    EmptyFactorSpace { extent: usize, parts: usize },

    #[error("choice menu is empty")]
    EmptyMenu,

    #[error("unknown policy `{0}`; expected `random`, `q` or `greedy`")]
    UnknownPolicy(String),
}
