//! Blank card images.
//!
//! The NDEF message is sized to fill the whole tag so the payload record can
//! later grow without re-framing. Layout of the produced image:
//!
//! ```text
//! [CC][TLV 03 len][URI record?][MIME record header][meta][main ...][aux]...[FE]
//! ```

use crate::cbor::EncodeConfig;
use crate::config::{RecordConfig, RootKind};
use crate::error::{RecordError, Result};
use crate::fields::{FieldMap, FieldValue};
use spooltag_protocol::ndef::{self, CapabilityContainer, OwnedRecord, CC_SIZE};
use tracing::debug;

/// Space reserved for the meta map when checking the payload is usable.
pub const MAX_META_SECTION_SIZE: usize = 8;

const EMPTY_MAP: [u8; 1] = [0xa0];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOptions {
    /// Usable tag memory in bytes, a multiple of 8
    pub size: usize,
    /// Aux region alignment; 1 disables alignment
    pub block_size: usize,
    /// Bytes reserved for the aux region
    pub aux_region: Option<usize>,
    /// Fixed meta region size; by default the meta map takes what it needs
    pub meta_region: Option<usize>,
    /// URI record placed before the payload record
    pub ndef_uri: Option<String>,
}

impl InitOptions {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            block_size: 4,
            aux_region: None,
            meta_region: None,
            ndef_uri: None,
        }
    }
}

fn fail(message: impl Into<String>) -> RecordError {
    RecordError::Initialize(message.into())
}

fn write_section(payload: &mut [u8], offset: usize, data: &[u8]) -> Result<usize> {
    let end = offset + data.len();
    if end > payload.len() {
        return Err(fail(format!(
            "section at {} of {} bytes exceeds the payload of {} bytes",
            offset,
            data.len(),
            payload.len()
        )));
    }
    payload[offset..end].copy_from_slice(data);
    Ok(data.len())
}

/// Build the memory image of an empty tag.
pub fn initialize_record(config: &RecordConfig, options: &InitOptions) -> Result<Vec<u8>> {
    if config.root != RootKind::Nfcv {
        return Err(fail("only nfcv records can be initialized"));
    }
    let meta_schema = config
        .meta
        .as_ref()
        .ok_or_else(|| fail("record configuration has no meta region"))?;

    let size = options.size;
    if size % 8 != 0 {
        return Err(fail(format!("Tag size {} must be divisible by 8", size)));
    }
    if size / 8 > 255 {
        return Err(fail("Tag too big to be representable in the CC"));
    }
    if options.block_size == 0 {
        return Err(fail("block size must be at least 1"));
    }

    let cc = CapabilityContainer::new(size);

    // CC, terminator and the short TLV header
    let mut message_len = size
        .checked_sub(CC_SIZE + 1 + 2)
        .ok_or_else(|| fail("tag too small"))?;
    if message_len > 0xFE {
        // Long TLV length takes two more bytes
        message_len -= 2;
    }
    let tlv_header_len = ndef::ndef_tlv_header(message_len).len();

    let mut records = Vec::new();
    if let Some(uri) = &options.ndef_uri {
        records.push(OwnedRecord::uri(uri));
    }
    let preceding_len = ndef::encode_message(&records).len();

    let mut record_header_len = 3 + config.mime_type.len();
    let mut payload_start = CC_SIZE + tlv_header_len + preceding_len + record_header_len;
    let mut payload_size = message_len
        .checked_sub(record_header_len + preceding_len)
        .ok_or_else(|| fail("There is not enough space even for the meta region"))?;
    if payload_size <= MAX_META_SECTION_SIZE {
        return Err(fail("There is not enough space even for the meta region"));
    }

    // Payloads over 255 bytes need the 4-byte NDEF length field
    if payload_size > 255 {
        record_header_len += 3;
        payload_start += 3;
        payload_size -= 3;
        if payload_size <= 255 {
            return Err(fail("Unable to fill the NDEF message correctly"));
        }
    }

    let align = |offset: usize, up: bool| -> usize {
        let misalignment = (payload_start + offset) % options.block_size;
        match (misalignment, up) {
            (0, _) => offset,
            (m, true) => offset + options.block_size - m,
            (m, false) => offset - m,
        }
    };

    let mut payload = vec![0u8; payload_size];
    let mut metadata = FieldMap::new();

    let mut main_offset = options.meta_region;
    if let Some(offset) = main_offset {
        metadata.insert("main_region_offset".to_string(), FieldValue::Int(offset as i64));
    }

    let mut aux_offset = None;
    if let Some(aux_size) = options.aux_region {
        if aux_size <= 4 {
            return Err(fail("Aux region is too small"));
        }
        let start = payload_size
            .checked_sub(aux_size)
            .ok_or_else(|| fail("Aux region does not fit into the payload"))?;
        let offset = align(start, false);
        metadata.insert("aux_region_offset".to_string(), FieldValue::Int(offset as i64));
        write_section(&mut payload, offset, &EMPTY_MAP)?;
        aux_offset = Some(offset);
    }

    // The meta map is rarely rewritten, so skip the extra break byte
    let meta = meta_schema.encode(
        &metadata,
        EncodeConfig {
            canonical: true,
            indefinite_containers: false,
        },
    )?;
    let meta_len = write_section(&mut payload, 0, &meta)?;
    let main_offset = match main_offset.take() {
        Some(offset) if offset < meta_len => {
            return Err(fail(format!(
                "meta region of {} bytes does not hold the {} byte meta map",
                offset, meta_len
            )))
        }
        Some(offset) => offset,
        None => meta_len,
    };

    let main_space = match aux_offset {
        Some(aux) => aux.checked_sub(main_offset).filter(|&space| space >= 4),
        None => payload_size.checked_sub(main_offset).filter(|&space| space >= 8),
    };
    if main_space.is_none() {
        return Err(fail("Main region is too small"));
    }
    write_section(&mut payload, main_offset, &EMPTY_MAP)?;

    records.push(OwnedRecord::mime(&config.mime_type, payload));
    let message = ndef::encode_message(&records);
    if message.len() != message_len {
        return Err(fail(format!(
            "NDEF record calculated incorrectly: expected {} ({} + {} + {}), got {}",
            message_len,
            preceding_len,
            record_header_len,
            payload_size,
            message.len()
        )));
    }

    let image = ndef::wrap_ndef_message(&cc, &message)?;
    debug!(size, payload_start, payload_size, main_offset, ?aux_offset, "initialized record");
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::region::RegionKind;
    use std::sync::Arc;

    fn config() -> RecordConfig {
        RecordConfig::builtin().unwrap()
    }

    #[test]
    fn test_small_tag_without_aux() {
        let image = initialize_record(&config(), &InitOptions::new(64)).unwrap();
        assert_eq!(image.len(), 64);
        assert_eq!(&image[..4], &[0xE1, 0x40, 8, 0x01]);
        assert_eq!(image[63], 0xFE);

        let record = Record::new(Arc::new(config()), image).unwrap();
        assert_eq!(record.payload().len(), 26);
        let main = record.region(RegionKind::Main).unwrap();
        assert_eq!((main.offset(), main.len()), (1, 25));
        assert!(record.read(RegionKind::Main).unwrap().is_empty());
    }

    #[test]
    fn test_large_tag_with_aligned_aux() {
        let mut options = InitOptions::new(320);
        options.aux_region = Some(32);
        let image = initialize_record(&config(), &options).unwrap();
        assert_eq!(image.len(), 320);
        // Long TLV length
        assert_eq!(&image[4..8], &[0x03, 0xFF, 0x01, 0x37]);

        let record = Record::new(Arc::new(config()), image).unwrap();
        let aux = record.region(RegionKind::Aux).unwrap();
        assert_eq!((record.payload_offset() + aux.offset()) % 4, 0);
        assert!(aux.len() >= 32);
        assert!(record.regions().iter().all(|r| !r.is_corrupt()));
    }

    #[test]
    fn test_uri_record_precedes_payload() {
        let mut options = InitOptions::new(128);
        options.ndef_uri = Some("https://example.com/spool".to_string());
        let image = initialize_record(&config(), &options).unwrap();
        let record = Record::new(Arc::new(config()), image).unwrap();
        assert_eq!(record.uri(), Some("https://example.com/spool"));
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert!(matches!(
            initialize_record(&config(), &InitOptions::new(60)),
            Err(RecordError::Initialize(_))
        ));
        assert!(matches!(
            initialize_record(&config(), &InitOptions::new(40)),
            Err(RecordError::Initialize(_))
        ));
        let mut options = InitOptions::new(64);
        options.aux_region = Some(4);
        assert!(matches!(
            initialize_record(&config(), &options),
            Err(RecordError::Initialize(_))
        ));
    }
}
