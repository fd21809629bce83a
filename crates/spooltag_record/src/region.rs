//! Payload regions.
//!
//! A region is an index range into the record's payload. Regions never own
//! bytes; reads borrow the payload and writes go through the record.

use crate::cbor::{self, EncodeConfig};
use crate::error::{RecordError, Result};
use crate::fields::{FieldMap, FieldSchema, RegionUpdate, UnknownFields};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Largest region the card class allows.
pub const MAX_REGION_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    Meta,
    Main,
    Aux,
}

impl RegionKind {
    pub const ALL: [RegionKind; 3] = [RegionKind::Meta, RegionKind::Main, RegionKind::Aux];

    pub fn as_str(&self) -> &'static str {
        match self {
            RegionKind::Meta => "meta",
            RegionKind::Main => "main",
            RegionKind::Aux => "aux",
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "meta" => Ok(RegionKind::Meta),
            "main" => Ok(RegionKind::Main),
            "aux" => Ok(RegionKind::Aux),
            other => Err(format!("unknown region '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Region {
    kind: RegionKind,
    /// Offset relative to the payload start
    offset: usize,
    len: usize,
    declared: usize,
    corrupt: bool,
    schema: Arc<FieldSchema>,
}

impl Region {
    /// Region of `declared` bytes at `offset`, clamped to `limit` (the next
    /// region start or the payload end).
    ///
    /// Clamping, an empty range or bytes that do not hold a CBOR map mark the
    /// region corrupt.
    pub fn new(
        kind: RegionKind,
        schema: Arc<FieldSchema>,
        payload: &[u8],
        offset: usize,
        declared: usize,
        limit: usize,
    ) -> Result<Self> {
        let end = offset.saturating_add(declared).min(limit).min(payload.len());
        let len = end.saturating_sub(offset);
        if len > MAX_REGION_SIZE {
            return Err(RecordError::RegionTooLarge { size: len });
        }

        let mut region = Self {
            kind,
            offset,
            len,
            declared,
            corrupt: false,
            schema,
        };
        region.corrupt = len != declared || len == 0 || cbor::decode_map(region.bytes(payload)).is_err();
        if region.corrupt {
            debug!(region = %kind, offset, len, declared, "region marked corrupt");
        }
        Ok(region)
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_corrupt(&self) -> bool {
        self.corrupt
    }

    pub fn schema(&self) -> &Arc<FieldSchema> {
        &self.schema
    }

    pub fn bytes<'a>(&self, payload: &'a [u8]) -> &'a [u8] {
        &payload[self.offset..self.offset + self.len]
    }

    /// Bytes taken by the encoded map; zero for a corrupt region.
    pub fn used_size(&self, payload: &[u8]) -> usize {
        if self.corrupt {
            return 0;
        }
        cbor::decode_map(self.bytes(payload)).map(|m| m.len).unwrap_or(0)
    }

    /// Decoded fields; a corrupt region reads as empty.
    pub fn read(&self, payload: &[u8], unknown: Option<&mut UnknownFields>) -> Result<FieldMap> {
        if self.corrupt {
            return Ok(FieldMap::new());
        }
        self.schema.decode(self.bytes(payload), unknown)
    }

    /// Encode `update` against the current content. `None` when there is
    /// nothing to change.
    pub fn encode_update(
        &self,
        payload: &[u8],
        update: &RegionUpdate,
        config: EncodeConfig,
    ) -> Result<Option<Vec<u8>>> {
        if update.fields.is_empty() && update.remove.is_empty() && !update.clear {
            return Ok(None);
        }
        let original = if self.corrupt { None } else { Some(self.bytes(payload)) };
        self.schema.update(original, update, config).map(Some)
    }

    /// Zero the region and store `encoded` at its start.
    ///
    /// Fails without touching the payload when `encoded` does not fit.
    pub fn store(&mut self, payload: &mut [u8], encoded: &[u8]) -> Result<usize> {
        if encoded.len() > self.len {
            return Err(RecordError::RegionOverflow {
                needed: encoded.len(),
                capacity: self.len,
            });
        }
        let target = &mut payload[self.offset..self.offset + self.len];
        target.fill(0);
        target[..encoded.len()].copy_from_slice(encoded);
        self.corrupt = self.len != self.declared;
        Ok(encoded.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldValue;

    fn schema() -> Arc<FieldSchema> {
        Arc::new(
            FieldSchema::from_yaml(
                "- {key: 0, name: count, type: int}\n- {key: 1, name: label, type: string, max_length: 32}\n",
                |_| Ok(String::new()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_corrupt_regions_read_empty() {
        // Not a map
        let payload = [0x01, 0x00, 0x00, 0x00];
        let region = Region::new(RegionKind::Main, schema(), &payload, 0, 4, 4).unwrap();
        assert!(region.is_corrupt());
        assert!(region.read(&payload, None).unwrap().is_empty());
        assert_eq!(region.used_size(&payload), 0);

        // Truncated map
        let payload = [0xbf, 0x00, 0x01];
        let region = Region::new(RegionKind::Main, schema(), &payload, 0, 3, 3).unwrap();
        assert!(region.is_corrupt());
        assert!(region.read(&payload, None).unwrap().is_empty());

        // Declared past the end of the payload
        let payload = [0xa0, 0x00];
        let region = Region::new(RegionKind::Aux, schema(), &payload, 0, 8, 2).unwrap();
        assert!(region.is_corrupt());
        assert_eq!(region.len(), 2);
    }

    #[test]
    fn test_oversized_region_rejected() {
        let payload = vec![0u8; 600];
        assert!(matches!(
            Region::new(RegionKind::Main, schema(), &payload, 0, 600, 600),
            Err(RecordError::RegionTooLarge { size: 600 })
        ));
    }

    #[test]
    fn test_store_zeroes_and_checks_capacity() {
        let mut payload = vec![0xa1, 0x00, 0x05, 0xee, 0xee, 0xee];
        let mut region = Region::new(RegionKind::Main, schema(), &payload, 0, 6, 6).unwrap();
        assert!(!region.is_corrupt());
        assert_eq!(region.used_size(&payload), 3);

        let too_big = vec![0u8; 7];
        let before = payload.clone();
        assert!(matches!(
            region.store(&mut payload, &too_big),
            Err(RecordError::RegionOverflow { needed: 7, capacity: 6 })
        ));
        assert_eq!(payload, before);

        let mut update = RegionUpdate::default();
        update.fields.insert("count".to_string(), FieldValue::Int(9));
        let config = EncodeConfig {
            canonical: true,
            indefinite_containers: false,
        };
        let encoded = region.encode_update(&payload, &update, config).unwrap().unwrap();
        assert_eq!(region.store(&mut payload, &encoded).unwrap(), 3);
        assert_eq!(payload, vec![0xa1, 0x00, 0x09, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_noop_update() {
        let payload = [0xa0];
        let region = Region::new(RegionKind::Main, schema(), &payload, 0, 1, 1).unwrap();
        let result = region
            .encode_update(&payload, &RegionUpdate::default(), EncodeConfig::default())
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_region_kind_parse() {
        assert_eq!("aux".parse::<RegionKind>().unwrap(), RegionKind::Aux);
        assert!("other".parse::<RegionKind>().is_err());
        assert_eq!(RegionKind::Meta.to_string(), "meta");
    }
}
