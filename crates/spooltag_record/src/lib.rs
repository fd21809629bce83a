//! Region-based record codec for OpenPrintTag cards.
//!
//! The payload of the card's MIME record is split into up to three CBOR
//! maps:
//!
//! ```text
//! payload: [meta map][main map ........][aux map ....]
//!           ^0        ^main_region_offset ^aux_region_offset
//! ```
//!
//! The meta map holds the offsets (and optional sizes) of the other
//! regions; missing offsets mean "right after the previous region". Every
//! region is at most 512 bytes and is rewritten in place: the region is
//! zeroed and the new map written at its start.
//!
//! Field values are typed by a YAML schema keyed by small integers. Decimal
//! numbers are always stored in the narrowest float width that keeps three
//! decimal places.

pub mod cbor;
pub mod check;
pub mod config;
pub mod error;
pub mod fields;
pub mod initialize;
pub mod record;
pub mod region;

pub use cbor::{CborValue, EncodeConfig};
pub use check::{semantic_check, CheckReport};
pub use config::{RecordConfig, RootKind};
pub use error::{FieldError, RecordError, Result};
pub use fields::{
    Field, FieldMap, FieldSchema, FieldType, FieldValue, RegionUpdate, Requirement, UnknownFields,
    ValidationReport,
};
pub use initialize::{initialize_record, InitOptions};
pub use record::{Record, RecordInfo, RegionInfo, RootInfo};
pub use region::{Region, RegionKind, MAX_REGION_SIZE};
