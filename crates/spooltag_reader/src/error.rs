//! Reader error types

use spooltag_protocol::ProtocolError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReaderError>;

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("Failed to open reader '{device}': {message}")]
    Open { device: String, message: String },

    #[error("Unsupported reader device '{0}'")]
    UnsupportedDevice(String),

    #[error("Reader timed out: {0}")]
    Timeout(String),

    #[error("Card protocol error: {0}")]
    Protocol(String),

    #[error("Tag is write protected")]
    WriteProtected,

    #[error("Card framing error: {0}")]
    Framing(#[from] ProtocolError),

    #[error("Reader I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Reader thread failed: {0}")]
    Thread(String),
}

impl ReaderError {
    /// Faults worth retrying on the next poll.
    pub fn is_transient(&self) -> bool {
        match self {
            ReaderError::Timeout(_) | ReaderError::Protocol(_) => true,
            ReaderError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::NotFound
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// What the poll loop does with an error that is not transient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Stop the loop and report the error from `join`.
    #[default]
    Stop,
    /// Log and keep polling.
    Continue,
}
