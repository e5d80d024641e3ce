use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::protocol::{ErrorCode, Response};

/// Every way a daemon operation can fail. The dispatcher turns these into error responses, the
/// code tells the client what happened and the message is meant for the user.
#[derive(Debug, Error)]
pub enum TrackError {
    #[error("'{0}' is not being tracked")]
    NotFound(String),

    #[error("Id '{0}' is already in use")]
    AlreadyExists(String),

    #[error("Already tracking {0}")]
    AlreadyTracking(String),

    #[error("Maximum process tracking limit exceeded. You can only track up to {limit} {} simultaneously", process_noun(.limit))]
    LimitExceeded { limit: usize },

    #[error("Refusing to track the daemon itself (pid {0})")]
    SelfTrack(u32),

    #[error("No running process matches {0}, please start the application")]
    ProcessNotFound(String),

    #[error("Invalid id '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("Invalid range: start {start} must be before end {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Storage failure: {0:#}")]
    IoFailure(#[source] anyhow::Error),

    #[error("Malformed request: {0}")]
    Protocol(String),

    #[error("Daemon stop refused: {0} processes are still being tracked")]
    Busy(usize),
}

fn process_noun(limit: &usize) -> &'static str {
    if *limit == 1 {
        "process"
    } else {
        "processes"
    }
}

impl TrackError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TrackError::NotFound(_) => ErrorCode::NotFound,
            TrackError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            TrackError::AlreadyTracking(_) => ErrorCode::AlreadyTracking,
            TrackError::LimitExceeded { .. } => ErrorCode::LimitExceeded,
            TrackError::SelfTrack(_) => ErrorCode::SelfTrack,
            TrackError::ProcessNotFound(_) => ErrorCode::ProcessNotFound,
            TrackError::InvalidId { .. } => ErrorCode::InvalidId,
            TrackError::InvalidRange { .. } => ErrorCode::InvalidRange,
            TrackError::IoFailure(_) => ErrorCode::IoFailure,
            TrackError::Protocol(_) => ErrorCode::ProtocolError,
            TrackError::Busy(_) => ErrorCode::Busy,
        }
    }
}

impl From<TrackError> for Response {
    fn from(value: TrackError) -> Self {
        Response::Error {
            code: value.code(),
            message: value.to_string(),
        }
    }
}
