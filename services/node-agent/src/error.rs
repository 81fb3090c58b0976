use cove_coord::CoordError;
use thiserror::Error;

/// Errors that end an instance supervisor or the host listener.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error("invalid service record: {0}")]
    Record(#[from] serde_json::Error),

    #[error("runtime error: {0}")]
    Runtime(#[from] anyhow::Error),
}
