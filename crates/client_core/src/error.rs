use std::time::Duration;

use reqwest::StatusCode;
use shared::error::ApiError;
use thiserror::Error;

/// Why a session refresh did not produce new credentials.
///
/// Cloned into every request that was waiting on the refresh, so it carries
/// no borrowed transport state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshFailure {
    #[error("refresh rejected with status {0}")]
    Rejected(StatusCode),
    #[error("refresh transport failure: {0}")]
    Transport(String),
    #[error("refresh timed out after {0:?}")]
    TimedOut(Duration),
}

impl RefreshFailure {
    /// Whether this failure ends the current session.
    pub fn expires_session(&self) -> bool {
        !matches!(self, Self::TimedOut(_))
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request unauthorized (refresh exhausted: {refresh_exhausted})")]
    Unauthorized { refresh_exhausted: bool },
    #[error("session refresh failed: {0}")]
    RefreshFailed(#[from] RefreshFailure),
    #[error("session refresh was abandoned before it settled")]
    RefreshAborted,
    #[error("request failed with status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
    },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("realtime connection failed: {0}")]
    Realtime(String),
}

impl ClientError {
    /// Authorization failures the refresh path could not recover from.
    ///
    /// A 401 on a call that was never allowed to refresh is not terminal:
    /// the caller opted out of recovery, the session itself may still be valid.
    pub fn is_terminal_auth(&self) -> bool {
        match self {
            Self::Unauthorized { refresh_exhausted } => *refresh_exhausted,
            Self::RefreshFailed(failure) => failure.expires_session(),
            _ => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::RefreshAborted
                | Self::RefreshFailed(RefreshFailure::TimedOut(_))
        )
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Unauthorized { .. } => Some(StatusCode::UNAUTHORIZED),
            _ => None,
        }
    }

    /// Structured error body, when the server sent one.
    pub fn api_error(&self) -> Option<ApiError> {
        match self {
            Self::Status { body, .. } => ApiError::from_body(body),
            _ => None,
        }
    }
}
