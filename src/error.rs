use thiserror::Error;

use crate::codec::ErrorCode;

/// A handler's refusal of an operation, carrying the TFTP error code and
/// message that should be sent to the peer verbatim.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for HandlerError {}

#[derive(Error, Debug)]
pub enum TftpError {
    /// A datagram that cannot be parsed as a well-formed TFTP packet.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A handler refused an operation with a specific wire error code.
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    /// General protocol/session-level error not tied to a handler.
    #[error("TFTP error: {0}")]
    Tftp(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TftpError>;
