//! Decoders that resolve a presented card to a (spool, filament) pair.
//!
//! Four decoders are provided, usually chained in this order:
//!
//! | name           | source                                   | side effects          |
//! |----------------|------------------------------------------|-----------------------|
//! | `tag_id`       | card UID stored on an inventory spool    | none                  |
//! | `ndef_text`    | `SPOOL:`/`FILAMENT:` lines in text records | none                |
//! | `opentag3d`    | fixed-offset `application/opentag3d`     | may create inventory  |
//! | `openprinttag` | CBOR regions of `application/vnd.openprinttag` | may create inventory |
//!
//! Decoders that create inventory entries store the card UID on the new
//! spool, so the next read of the same card is resolved by `tag_id`.

pub mod chain;
pub mod error;
pub mod import;
pub mod inventory;
pub mod ndef_text;
pub mod openprinttag;
pub mod opentag3d;
pub mod tag_id;

pub use chain::{ParserChain, TagParser};
pub use error::{InventoryError, Result};
pub use import::ImportSettings;
pub use inventory::{Inventory, MemoryInventory};
pub use ndef_text::NdefTextParser;
pub use openprinttag::OpenPrintTagParser;
pub use opentag3d::OpenTag3dParser;
pub use tag_id::TagIdParser;
