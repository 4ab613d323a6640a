use std::path::PathBuf;

use thiserror::Error;

use crate::types::RunStatus;

pub type TrafficResult<T> = Result<T, TrafficError>;

#[derive(Error, Debug)]
pub enum TrafficError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Campaign {0} is already running")]
    AlreadyRunning(String),

    #[error("Campaign {0} is not running")]
    NotRunning(String),

    #[error("Campaign {0} not found")]
    NotFound(String),

    #[error("Campaign {campaign_id} cannot move from {from} to {to}")]
    InvalidTransition {
        campaign_id: String,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Storage error: {op} {}: {source}", .path.display())]
    Storage {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Simulation error: {0}")]
    Simulation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TrafficError {
    pub fn storage(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            op,
            path: path.into(),
            source,
        }
    }

    /// Errors that end a worker run instead of being downgraded to a failed record.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. } | Self::Serialization(_) | Self::Internal(_)
        )
    }
}
