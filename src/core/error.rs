use serde::Serialize;
use thiserror::Error;

/// Stable wire vocabulary for tool-call and WebSocket errors.
///
/// Every failure that crosses a channel boundary is reported as one of
/// these kinds; the serialized form is the kebab-case string clients
/// match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    MissingParams,
    Exists,
    NotFound,
    AuthFailed,
    Unreachable,
    TransportLost,
    BrowserCommandsExecuted,
    Busy,
    NotRunning,
    Cancelled,
    Timeout,
    WebUnavailable,
    Internal,
}

impl ErrorKind {
    /// The wire string for this kind (matches the serde representation).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingParams => "missing-params",
            ErrorKind::Exists => "exists",
            ErrorKind::NotFound => "not-found",
            ErrorKind::AuthFailed => "auth-failed",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::TransportLost => "transport-lost",
            ErrorKind::BrowserCommandsExecuted => "browser-commands-executed",
            ErrorKind::Busy => "busy",
            ErrorKind::NotRunning => "not-running",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::WebUnavailable => "web-unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Session-level errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    SshError(#[from] crate::ssh::error::SshError),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    Exists(String),

    #[error("Session is closed")]
    Closed,

    #[error("No command is running")]
    NotRunning,

    #[error("Command queue is full")]
    Busy,

    #[error("Invalid parameter: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Map onto the wire vocabulary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::IoError(_) => ErrorKind::TransportLost,
            SessionError::SshError(e) => e.kind(),
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::Exists(_) => ErrorKind::Exists,
            SessionError::Closed => ErrorKind::TransportLost,
            SessionError::NotRunning => ErrorKind::NotRunning,
            SessionError::Busy => ErrorKind::Busy,
            SessionError::InvalidParams(_) => ErrorKind::MissingParams,
            SessionError::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_strings() {
        assert_eq!(
            ErrorKind::BrowserCommandsExecuted.as_str(),
            "browser-commands-executed"
        );
        assert_eq!(ErrorKind::TransportLost.as_str(), "transport-lost");
        assert_eq!(
            serde_json::to_string(&ErrorKind::NotRunning).unwrap(),
            "\"not-running\""
        );
    }

    #[test]
    fn test_session_error_mapping() {
        assert_eq!(SessionError::Busy.kind(), ErrorKind::Busy);
        assert_eq!(
            SessionError::NotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(SessionError::Closed.kind(), ErrorKind::TransportLost);
    }
}
