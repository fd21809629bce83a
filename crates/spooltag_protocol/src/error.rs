//! Card framing error types

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Capability container too short: expected {expected} bytes, got {got}")]
    CapabilityContainerTooShort { expected: usize, got: usize },

    #[error("Capability container magic mismatch: expected {expected:#04x}, got {got:#04x}")]
    MagicMismatch { expected: u8, got: u8 },

    #[error("NDEF TLV not found")]
    NdefTlvNotFound,

    #[error("TLV block at offset {offset} runs past the end of memory")]
    TlvTruncated { offset: usize },

    #[error("NDEF record at offset {offset} is truncated")]
    RecordTruncated { offset: usize },

    #[error("Chunked NDEF records are not supported")]
    ChunkedRecord,

    #[error("NDEF message has no records")]
    EmptyMessage,

    #[error("No record of type '{0}'")]
    RecordNotFound(String),

    #[error("Message of {size} bytes does not fit into {capacity} bytes of card memory")]
    MessageTooLarge { size: usize, capacity: usize },

    #[error("Invalid text record: {0}")]
    InvalidText(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}
