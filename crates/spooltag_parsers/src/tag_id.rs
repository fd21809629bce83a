//! Lookup of the card identifier in the inventory.

use crate::chain::TagParser;
use crate::inventory::{spool_pair, Inventory};
use spooltag_protocol::{ReadEvent, TagIds};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct TagIdParser {
    inventory: Arc<dyn Inventory>,
}

impl TagIdParser {
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        Self { inventory }
    }
}

impl TagParser for TagIdParser {
    fn name(&self) -> &'static str {
        "tag_id"
    }

    fn parse(&self, event: &ReadEvent) -> TagIds {
        match self.inventory.find_spool_by_nfc_id(&event.identifier) {
            Ok(Some(spool)) => match spool_pair(&spool) {
                Some((spool, filament)) => TagIds::new(spool.to_string(), filament.to_string()),
                None => {
                    debug!(identifier = %event.identifier, "spool without filament id");
                    TagIds::empty()
                }
            },
            Ok(None) => TagIds::empty(),
            Err(e) => {
                warn!(identifier = %event.identifier, error = %e, "inventory lookup failed");
                TagIds::empty()
            }
        }
    }
}
