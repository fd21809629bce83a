//! Region codec error types

use spooltag_protocol::ProtocolError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecordError>;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Card framing error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Field '{name}' duplicates key {key}")]
    DuplicateKey { key: u32, name: String },

    #[error("Field name '{0}' defined twice")]
    DuplicateName(String),

    #[error("Unknown field '{0}'")]
    UnknownField(String),

    #[error("Unknown CBOR key '{0}'")]
    UnknownKey(String),

    #[error("Field {key} {name}: {source}")]
    Field {
        key: u32,
        name: String,
        #[source]
        source: FieldError,
    },

    #[error("CBOR decode error at offset {offset}: {message}")]
    CborDecode { offset: usize, message: String },

    #[error("Region data is not a CBOR map")]
    NotAMap,

    #[error("Region of {size} bytes exceeds the 512 byte limit")]
    RegionTooLarge { size: usize },

    #[error("Data of size {needed} does not fit into region of size {capacity}")]
    RegionOverflow { needed: usize, capacity: usize },

    #[error("Invalid region layout: {0}")]
    Layout(String),

    #[error("Region '{0}' not present")]
    MissingRegion(&'static str),

    #[error("Did not find a record of type '{0}'")]
    RecordNotFound(String),

    #[error("Cannot initialize record: {0}")]
    Initialize(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Per-value coercion failures, wrapped into [`RecordError::Field`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    #[error("expected {expected}, got {found}")]
    TypeMismatch { expected: &'static str, found: String },

    #[error("length {len} exceeds maximum {max}")]
    TooLong { len: usize, max: usize },

    #[error("unknown item '{0}'")]
    UnknownItem(String),

    #[error("invalid color '{0}'")]
    InvalidColor(String),

    #[error("invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("invalid hex string '{0}'")]
    InvalidHex(String),
}
