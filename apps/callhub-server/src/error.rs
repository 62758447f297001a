use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures reported synchronously to the acting client. None of these are
/// ever broadcast to other participants.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("room {room_id} already has an admin")]
    AdminConflict { room_id: String },
    #[error("only the room admin may {action}")]
    Unauthorized { action: &'static str },
    #[error("connection has not joined a room")]
    NotInRoom,
    #[error("participant {target_id} already has a screen share in progress")]
    Busy { target_id: String },
}

/// Stable machine-readable error label sent on the wire
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    AdminConflict,
    Unauthorized,
    NotInRoom,
    Busy,
}

impl SessionError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        SessionError::InvalidRequest(reason.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            SessionError::AdminConflict { .. } => ErrorCode::AdminConflict,
            SessionError::Unauthorized { .. } => ErrorCode::Unauthorized,
            SessionError::NotInRoom => ErrorCode::NotInRoom,
            SessionError::Busy { .. } => ErrorCode::Busy,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        self.code().as_str()
    }
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::AdminConflict => "admin_conflict",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::NotInRoom => "not_in_room",
            ErrorCode::Busy => "busy",
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
