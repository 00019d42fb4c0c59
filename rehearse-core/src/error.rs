use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::store::StoreError;
use crate::transcription::TranscriptionError;

/// Caller-facing error taxonomy. Lower layers convert into this at the
/// orchestration boundary; the HTTP layer maps each variant to a status code.
#[derive(Error, Debug)]
pub enum RehearseError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Session quota exceeded: {remaining} remaining, resets at {reset_at}")]
    QuotaExceeded {
        remaining: u32,
        reset_at: DateTime<Utc>,
    },

    #[error("Service paused: usage limits exceeded")]
    ServicePaused,

    #[error("Upstream temporarily unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for RehearseError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => RehearseError::NotFound(what),
            StoreError::Conflict(what) => RehearseError::Conflict(what),
            other => RehearseError::Persistence(other.to_string()),
        }
    }
}

impl From<GatewayError> for RehearseError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::ServicePaused => RehearseError::ServicePaused,
            other => RehearseError::UpstreamUnavailable(other.to_string()),
        }
    }
}

impl From<TranscriptionError> for RehearseError {
    fn from(e: TranscriptionError) -> Self {
        match e {
            TranscriptionError::ServicePaused => RehearseError::ServicePaused,
            TranscriptionError::EmptyAudio => {
                RehearseError::Validation("audio payload is empty".to_string())
            }
            other => RehearseError::UpstreamUnavailable(other.to_string()),
        }
    }
}
