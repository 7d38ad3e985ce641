use crate::core::error::ErrorKind;
use thiserror::Error;

/// SSH-related errors
#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection error: {0}")]
    Unreachable(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Transport lost: {0}")]
    TransportLost(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => SshError::IoError(e),
            russh::Error::Disconnect => SshError::TransportLost("Disconnected".to_string()),
            russh::Error::ChannelOpenFailure(_) => {
                SshError::ChannelError("Channel open failed".to_string())
            }
            _ => SshError::ProtocolError(err.to_string()),
        }
    }
}

impl SshError {
    /// Map onto the wire vocabulary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SshError::Unreachable(_) => ErrorKind::Unreachable,
            SshError::AuthFailed(_) | SshError::KeyError(_) => ErrorKind::AuthFailed,
            SshError::ChannelError(_) => ErrorKind::TransportLost,
            SshError::TransportLost(_) => ErrorKind::TransportLost,
            SshError::IoError(_) => ErrorKind::TransportLost,
            SshError::ProtocolError(_) => ErrorKind::Internal,
        }
    }
}
