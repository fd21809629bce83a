//! Shared types and card framing for spooltag.
//!
//! # Card memory
//!
//! Cards handled here follow the NFC Forum layout:
//! ```text
//! [E1][VER<<4|ACCESS][SIZE/8][CAPS] [TLV]... [0x03 LEN NDEF-MESSAGE] [0xFE]
//! ```
//!
//! - CC (4 bytes): magic `0xE1`, mapping version and access nibbles, data
//!   area size divided by 8, capability flags
//! - TLV length: 1 byte, or `0xFF` followed by a big-endian u16
//! - NDEF message: records identified by type (`urn:nfc:wkt:T`, MIME types)

pub mod defaults;
pub mod error;
pub mod ndef;
pub mod types;

pub use error::{ProtocolError, Result};
pub use ndef::{CapabilityContainer, NdefRecord, OwnedRecord, Tnf};
pub use types::{
    format_identifier, ReadEvent, Request, Response, ResponseStatus, StateSnapshot, TagIds,
    WriteRequest,
};
