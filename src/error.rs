use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentError {
    #[error("surface error: {0}")]
    Surface(String),
    #[error("perception error: {0}")]
    Perception(String),
    #[error("detection error: {0}")]
    Detection(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("no target: index {index:?} outside snapshot of {len} elements")]
    NoTarget { index: Option<i64>, len: usize },
    #[error("action error: {0}")]
    Action(String),
    #[error("oracle error: {0}")]
    Oracle(String),
    #[error("artifact error: {0}")]
    Artifact(String),
}

impl AgentError {
    pub(crate) fn surface(err: impl std::fmt::Display) -> Self {
        AgentError::Surface(err.to_string())
    }
}
