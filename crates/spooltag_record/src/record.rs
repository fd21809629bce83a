//! A card image split into regions.

use crate::cbor::{self, EncodeConfig};
use crate::config::{RecordConfig, RootKind};
use crate::error::{RecordError, Result};
use crate::fields::{FieldMap, FieldSchema, FieldValue, RegionUpdate, UnknownFields, ValidationReport};
use crate::region::{Region, RegionKind};
use serde::Serialize;
use spooltag_protocol::ndef::{self, CapabilityContainer, Tnf, CC_SIZE};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionInfo {
    pub payload_offset: usize,
    pub absolute_offset: usize,
    pub size: usize,
    pub used_size: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_corrupt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootInfo {
    pub data_size: usize,
    pub payload_size: usize,
    pub overhead: usize,
    pub payload_used_size: usize,
    pub total_used_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordInfo {
    pub regions: BTreeMap<RegionKind, RegionInfo>,
    pub root: RootInfo,
    pub uri: Option<String>,
}

/// Raw card memory plus the region layout found in it.
#[derive(Debug, Clone)]
pub struct Record {
    config: Arc<RecordConfig>,
    data: Vec<u8>,
    payload: Range<usize>,
    uri: Option<String>,
    regions: Vec<Region>,
    encode_config: EncodeConfig,
}

impl Record {
    pub fn new(config: Arc<RecordConfig>, data: Vec<u8>) -> Result<Self> {
        let (payload, uri) = match config.root {
            RootKind::None => (0..data.len(), None),
            RootKind::Nfcv => locate_payload(&data, &config.mime_type)?,
        };
        let regions = setup_regions(&config, &data[payload.clone()])?;

        Ok(Self {
            config,
            data,
            payload,
            uri,
            regions,
            encode_config: EncodeConfig::default(),
        })
    }

    pub fn config(&self) -> &Arc<RecordConfig> {
        &self.config
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload.clone()]
    }

    /// Offset of the payload inside the card memory.
    pub fn payload_offset(&self) -> usize {
        self.payload.start
    }

    /// URI record preceding the payload record, if any.
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region(&self, kind: RegionKind) -> Option<&Region> {
        self.regions.iter().find(|r| r.kind() == kind)
    }

    fn require(&self, kind: RegionKind) -> Result<&Region> {
        self.region(kind).ok_or(RecordError::MissingRegion(kind.as_str()))
    }

    pub fn encode_config(&self) -> EncodeConfig {
        self.encode_config
    }

    pub fn set_encode_config(&mut self, config: EncodeConfig) {
        self.encode_config = config;
    }

    pub fn read(&self, kind: RegionKind) -> Result<FieldMap> {
        self.require(kind)?.read(self.payload(), None)
    }

    /// Read, capturing keys outside the schema into `unknown`.
    pub fn read_with_unknown(&self, kind: RegionKind, unknown: &mut UnknownFields) -> Result<FieldMap> {
        self.require(kind)?.read(self.payload(), Some(unknown))
    }

    /// Apply `update` to a region in place. Returns the encoded size, zero
    /// when there was nothing to do.
    pub fn update(&mut self, kind: RegionKind, update: &RegionUpdate) -> Result<usize> {
        let payload = &mut self.data[self.payload.clone()];
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.kind() == kind)
            .ok_or(RecordError::MissingRegion(kind.as_str()))?;

        let Some(encoded) = region.encode_update(payload, update, self.encode_config)? else {
            return Ok(0);
        };
        let written = region.store(payload, &encoded)?;
        debug!(region = %kind, written, capacity = region.len(), "region updated");
        Ok(written)
    }

    /// Replace a region's content with `fields`.
    pub fn write(&mut self, kind: RegionKind, fields: &FieldMap) -> Result<usize> {
        self.update(
            kind,
            &RegionUpdate {
                fields: fields.clone(),
                remove: Vec::new(),
                clear: true,
            },
        )
    }

    pub fn info(&self) -> RecordInfo {
        let payload = self.payload();
        let mut regions = BTreeMap::new();
        let mut payload_used_size = 0;

        for region in &self.regions {
            let used_size = region.used_size(payload);
            payload_used_size += used_size;
            regions.insert(
                region.kind(),
                RegionInfo {
                    payload_offset: region.offset(),
                    absolute_offset: region.offset() + self.payload.start,
                    size: region.len(),
                    used_size,
                    is_corrupt: region.is_corrupt(),
                },
            );
        }

        let overhead = self.data.len() - payload.len();
        RecordInfo {
            regions,
            root: RootInfo {
                data_size: self.data.len(),
                payload_size: payload.len(),
                overhead,
                payload_used_size,
                total_used_size: payload_used_size + overhead,
            },
            uri: self.uri.clone(),
        }
    }

    /// Missing required fields are errors; missing recommended fields and
    /// unknown keys are warnings.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        for region in &self.regions {
            let mut unknown = UnknownFields::default();
            let values = match region.read(self.payload(), Some(&mut unknown)) {
                Ok(values) => values,
                Err(e) => {
                    report.errors.push(format!("Region '{}': {}", region.kind(), e));
                    continue;
                }
            };
            if !unknown.is_empty() {
                report
                    .warnings
                    .push(format!("Region '{}' contains unknown fields", region.kind()));
            }
            report.merge(region.schema().validate(&values));
        }
        report
    }
}

/// Payload range of the record typed `mime_type`, plus any URI record seen
/// before it.
fn locate_payload(data: &[u8], mime_type: &str) -> Result<(Range<usize>, Option<String>)> {
    CapabilityContainer::parse(data)?;
    let message = ndef::find_ndef_tlv(data, CC_SIZE)?;
    let records = ndef::decode_message(data, message)?;

    let mut uri = None;
    for record in &records {
        if record.tnf == Tnf::WellKnown && record.record_type == b"U" {
            uri = Some(ndef::decode_uri(record.payload(data)));
        }
        if record.type_name() == mime_type {
            return Ok((record.payload.clone(), uri));
        }
    }
    Err(RecordError::RecordNotFound(mime_type.to_string()))
}

fn meta_usize(meta: &FieldMap, name: &str) -> Result<Option<usize>> {
    match meta.get(name) {
        None => Ok(None),
        Some(FieldValue::Int(n)) if *n >= 0 => Ok(Some(*n as usize)),
        Some(other) => Err(RecordError::Layout(format!("invalid {} '{}'", name, other))),
    }
}

/// Region at `offset` running to `limit`, or an empty corrupt region when
/// the layout left it no room.
fn layout_region(
    kind: RegionKind,
    schema: Arc<FieldSchema>,
    payload: &[u8],
    offset: usize,
    declared: Option<usize>,
    limit: Option<usize>,
) -> Result<Region> {
    match limit {
        Some(limit) => Region::new(kind, schema, payload, offset, declared.unwrap_or(limit - offset), limit),
        None => {
            warn!(region = %kind, offset, payload_len = payload.len(), "region offset overlaps another region or the payload end");
            let offset = offset.min(payload.len());
            Region::new(kind, schema, payload, offset, declared.unwrap_or(0), offset)
        }
    }
}

fn setup_regions(config: &RecordConfig, payload: &[u8]) -> Result<Vec<Region>> {
    let Some(meta_schema) = config.meta.clone() else {
        // Without a meta region the main region spans the whole payload
        let main = Region::new(
            RegionKind::Main,
            config.main.clone(),
            payload,
            0,
            payload.len(),
            payload.len(),
        )?;
        return Ok(vec![main]);
    };

    let meta_map = cbor::decode_map(payload)?;
    let meta_size = meta_map.len;
    let metadata = meta_schema.decode_entries(payload, &meta_map, None)?;

    let main_offset = meta_usize(&metadata, "main_region_offset")?.unwrap_or(meta_size);
    let main_size = meta_usize(&metadata, "main_region_size")?;
    let aux_offset = meta_usize(&metadata, "aux_region_offset")?;
    let aux_size = meta_usize(&metadata, "aux_region_size")?;

    if aux_size.is_some() && aux_offset.is_none() {
        return Err(RecordError::Layout(
            "aux_region_size present without aux_region_offset".to_string(),
        ));
    }

    // Offsets inside meta, at or past the payload end, or aux on the main
    // offset are not region stops; such regions are empty and corrupt.
    let usable = |offset: usize| offset >= meta_size && offset < payload.len();
    let main_valid = usable(main_offset);
    let aux_valid = aux_offset.is_some_and(|offset| usable(offset) && !(main_valid && offset == main_offset));

    let mut stops: Vec<usize> = [
        main_valid.then_some(main_offset),
        aux_offset.filter(|_| aux_valid),
        Some(payload.len()),
    ]
    .into_iter()
    .flatten()
    .collect();
    stops.sort_unstable();
    let next_stop = |offset: usize| {
        stops
            .iter()
            .copied()
            .find(|&stop| stop > offset)
            .unwrap_or(payload.len())
    };

    let mut regions = Vec::with_capacity(3);
    let meta_limit = next_stop(0);
    regions.push(Region::new(RegionKind::Meta, meta_schema, payload, 0, meta_limit, meta_limit)?);

    regions.push(layout_region(
        RegionKind::Main,
        config.main.clone(),
        payload,
        main_offset,
        main_size,
        main_valid.then(|| next_stop(main_offset)),
    )?);

    if let Some(aux_offset) = aux_offset {
        let aux_schema = config.aux.clone().ok_or_else(|| {
            RecordError::Layout("card declares an aux region but no aux schema is configured".to_string())
        })?;
        regions.push(layout_region(
            RegionKind::Aux,
            aux_schema,
            payload,
            aux_offset,
            aux_size,
            aux_valid.then(|| next_stop(aux_offset)),
        )?);
    }

    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin() -> Arc<RecordConfig> {
        Arc::new(RecordConfig::builtin().unwrap())
    }

    /// CC + TLV + one MIME record holding `payload`.
    fn card(payload: Vec<u8>) -> Vec<u8> {
        let message = ndef::encode_message(&[ndef::OwnedRecord::mime(
            "application/vnd.openprinttag",
            payload,
        )]);
        let mut memory = ndef::wrap_ndef_message(&CapabilityContainer::new(512), &message).unwrap();
        memory.resize(512, 0);
        memory
    }

    #[test]
    fn test_regions_follow_meta_layout() {
        // meta {2: 20}, main at 3..20, aux at 20..32
        let mut payload = vec![0u8; 32];
        payload[..3].copy_from_slice(&[0xa1, 0x02, 0x14]);
        payload[3] = 0xa0;
        payload[20] = 0xa0;

        let record = Record::new(builtin(), card(payload)).unwrap();
        let main = record.region(RegionKind::Main).unwrap();
        assert_eq!((main.offset(), main.len()), (3, 17));
        let aux = record.region(RegionKind::Aux).unwrap();
        assert_eq!((aux.offset(), aux.len()), (20, 12));
        assert!(record.regions().iter().all(|r| !r.is_corrupt()));

        let info = record.info();
        assert_eq!(info.regions[&RegionKind::Main].absolute_offset, 3 + record.payload_offset());
        assert_eq!(info.root.payload_size, 32);
        assert_eq!(info.root.payload_used_size, 5);
    }

    #[test]
    fn test_without_aux_main_runs_to_payload_end() {
        let mut payload = vec![0u8; 16];
        payload[0] = 0xa0;
        payload[1] = 0xa0;
        let record = Record::new(builtin(), card(payload)).unwrap();
        let main = record.region(RegionKind::Main).unwrap();
        assert_eq!((main.offset(), main.len()), (1, 15));
        assert!(record.region(RegionKind::Aux).is_none());
        assert!(matches!(
            record.read(RegionKind::Aux),
            Err(RecordError::MissingRegion("aux"))
        ));
    }

    #[test]
    fn test_aux_size_without_offset_rejected() {
        // meta {3: 8}
        let mut payload = vec![0u8; 16];
        payload[..3].copy_from_slice(&[0xa1, 0x03, 0x08]);
        assert!(matches!(
            Record::new(builtin(), card(payload)),
            Err(RecordError::Layout(_))
        ));
    }

    #[test]
    fn test_aux_at_main_offset_is_corrupt() {
        // meta {2: 3}: aux declared where the main region starts
        let mut payload = vec![0u8; 32];
        payload[..3].copy_from_slice(&[0xa1, 0x02, 0x03]);
        payload[3] = 0xa0;
        let mut record = Record::new(builtin(), card(payload)).unwrap();

        let main = record.region(RegionKind::Main).unwrap();
        assert_eq!((main.offset(), main.len()), (3, 29));
        assert!(!main.is_corrupt());
        let aux = record.region(RegionKind::Aux).unwrap();
        assert!(aux.is_corrupt());
        assert_eq!(aux.len(), 0);

        let before = record.payload().to_vec();
        assert!(matches!(
            record.write(RegionKind::Aux, &FieldMap::new()),
            Err(RecordError::RegionOverflow { capacity: 0, .. })
        ));
        assert_eq!(record.payload(), &before[..]);
        assert!(record.read(RegionKind::Aux).unwrap().is_empty());
    }

    #[test]
    fn test_aux_inside_meta_is_corrupt() {
        // meta {2: 1}
        let mut payload = vec![0u8; 32];
        payload[..3].copy_from_slice(&[0xa1, 0x02, 0x01]);
        payload[3] = 0xa0;
        let record = Record::new(builtin(), card(payload)).unwrap();

        let meta = record.region(RegionKind::Meta).unwrap();
        let main = record.region(RegionKind::Main).unwrap();
        let aux = record.region(RegionKind::Aux).unwrap();
        assert_eq!(meta.len(), 3);
        assert_eq!((main.offset(), main.len()), (3, 29));
        assert!(aux.is_corrupt());
        assert_eq!(aux.len(), 0);
    }

    #[test]
    fn test_main_offset_past_payload_end_is_clamped() {
        // meta {0: 64} in a 32 byte payload
        let mut payload = vec![0u8; 32];
        payload[..4].copy_from_slice(&[0xa1, 0x00, 0x18, 0x40]);
        let mut record = Record::new(builtin(), card(payload)).unwrap();

        let main = record.region(RegionKind::Main).unwrap();
        assert_eq!((main.offset(), main.len()), (32, 0));
        assert!(main.is_corrupt());
        assert!(record.info().regions[&RegionKind::Main].is_corrupt);
        assert!(record.read(RegionKind::Main).unwrap().is_empty());
        assert!(matches!(
            record.write(RegionKind::Main, &FieldMap::new()),
            Err(RecordError::RegionOverflow { .. })
        ));
    }

    #[test]
    fn test_main_offset_inside_meta_is_corrupt() {
        // meta {0: 1}
        let mut payload = vec![0u8; 16];
        payload[..3].copy_from_slice(&[0xa1, 0x00, 0x01]);
        let record = Record::new(builtin(), card(payload)).unwrap();
        let main = record.region(RegionKind::Main).unwrap();
        assert!(main.is_corrupt());
        assert_eq!(main.len(), 0);
        assert_eq!(record.region(RegionKind::Meta).unwrap().len(), 16);
    }

    #[test]
    fn test_missing_mime_record() {
        let message = ndef::text_record_message(1, 2);
        let mut memory = ndef::wrap_ndef_message(&CapabilityContainer::new(64), &message).unwrap();
        memory.resize(64, 0);
        assert!(matches!(
            Record::new(builtin(), memory),
            Err(RecordError::RecordNotFound(_))
        ));
    }

    #[test]
    fn test_write_then_read_main() {
        let mut payload = vec![0u8; 40];
        payload[0] = 0xa0;
        payload[1] = 0xa0;
        let mut record = Record::new(builtin(), card(payload)).unwrap();

        let mut fields = FieldMap::new();
        fields.insert("material_class".to_string(), FieldValue::Text("FFF".to_string()));
        fields.insert("brand_name".to_string(), FieldValue::Text("Acme".to_string()));
        fields.insert("nominal_netto_full_weight".to_string(), FieldValue::Number(1000.0));
        record.write(RegionKind::Main, &fields).unwrap();

        let read = record.read(RegionKind::Main).unwrap();
        assert_eq!(read["brand_name"], FieldValue::Text("Acme".to_string()));
        assert_eq!(read["nominal_netto_full_weight"], FieldValue::Int(1000));

        // The rewritten buffer parses the same way
        let reparsed = Record::new(builtin(), record.data().to_vec()).unwrap();
        assert_eq!(reparsed.read(RegionKind::Main).unwrap(), read);
    }

    #[test]
    fn test_validate_reports_missing_fields() {
        let mut payload = vec![0u8; 16];
        payload[0] = 0xa0;
        payload[1] = 0xa0;
        let record = Record::new(builtin(), card(payload)).unwrap();
        let report = record.validate();
        assert!(report
            .errors
            .contains(&"Missing required field 'material_class'".to_string()));
        assert!(report
            .warnings
            .contains(&"Missing recommended field 'brand_name'".to_string()));
    }

    #[test]
    fn test_plain_root_uses_whole_buffer() {
        let config = Arc::new(RecordConfig {
            root: RootKind::None,
            mime_type: String::new(),
            meta: None,
            main: builtin().main.clone(),
            aux: None,
        });
        let record = Record::new(config, vec![0xa1, 0x0b, 0x61, b'X', 0x00]).unwrap();
        assert_eq!(record.region(RegionKind::Main).unwrap().len(), 5);
        assert_eq!(
            record.read(RegionKind::Main).unwrap()["brand_name"],
            FieldValue::Text("X".to_string())
        );
    }
}
