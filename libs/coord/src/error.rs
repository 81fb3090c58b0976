use thiserror::Error;

use crate::state::StateError;

/// Errors returned by coordination store operations.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid state id: {0}")]
    InvalidStateId(String),

    #[error("session expired")]
    SessionExpired,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    State(Box<StateError>),
}

impl CoordError {
    pub fn is_no_node(&self) -> bool {
        matches!(self, CoordError::NoNode(_))
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self, CoordError::NodeExists(_))
    }

    /// The state error carried by this error, if any.
    pub fn as_state(&self) -> Option<&StateError> {
        match self {
            CoordError::State(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StateError> for CoordError {
    fn from(err: StateError) -> Self {
        CoordError::State(Box::new(err))
    }
}
