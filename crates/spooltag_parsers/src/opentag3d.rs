//! OpenTag3D fixed-offset layout.
//!
//! The payload of the `application/opentag3d` record is a fixed table:
//!
//! ```text
//! 0x00  2  version marker (0x0001)     0x5C  2  diameter, um
//! 0x02  5  base material               0x5E  2  target weight, g
//! 0x07  5  material modifiers          0x60  1  print temperature / 5
//! 0x1B 16  manufacturer                0x61  1  bed temperature / 5
//! 0x2B 32  color name                  0x62  2  density, ug/cm3
//! 0x4B  4  primary RGBA                0x70.. optional extensions
//! 0x50 12  secondary RGBA x3
//! ```
//!
//! Older tags carry `OT` at 0x10 and the same fields packed after it.

use crate::chain::TagParser;
use crate::import::{filament_name, import_spool, ImportPlan, ImportSettings, TagData};
use crate::inventory::Inventory;
use byteorder::{BigEndian, ByteOrder};
use serde_json::{Map, Value};
use spooltag_protocol::defaults::{DEFAULT_DENSITY, DEFAULT_OPENTAG3D_NAME_TEMPLATE, OPENTAG3D_MIME_TYPE};
use spooltag_protocol::ndef;
use spooltag_protocol::{ReadEvent, TagIds};
use std::sync::Arc;
use tracing::{debug, warn};

pub const VERSION_MARKER: u16 = 0x0001;
pub const LEGACY_MARKER: &[u8; 2] = b"OT";
const LEGACY_MARKER_OFFSET: usize = 0x10;

struct Layout {
    name: &'static str,
    min_len: usize,
    base: usize,
    modifiers: usize,
    manufacturer: usize,
    color_name: usize,
    color: usize,
    extra_colors: &'static [usize],
    diameter: usize,
    weight: usize,
    print_temp: usize,
    bed_temp: usize,
    density: usize,
    extensions: bool,
}

const CURRENT: Layout = Layout {
    name: "current",
    min_len: 0x64,
    base: 0x02,
    modifiers: 0x07,
    manufacturer: 0x1B,
    color_name: 0x2B,
    color: 0x4B,
    extra_colors: &[0x50, 0x54, 0x58],
    diameter: 0x5C,
    weight: 0x5E,
    print_temp: 0x60,
    bed_temp: 0x61,
    density: 0x62,
    extensions: true,
};

const LEGACY: Layout = Layout {
    name: "legacy",
    min_len: 0x58,
    base: 0x12,
    modifiers: 0x17,
    manufacturer: 0x1C,
    color_name: 0x2C,
    color: 0x4C,
    extra_colors: &[],
    diameter: 0x50,
    weight: 0x52,
    print_temp: 0x54,
    bed_temp: 0x55,
    density: 0x56,
    extensions: false,
};

// Extension fields of the current layout
const SERIAL: (usize, usize) = (0x70, 16);
const MANUFACTURE_DATE: usize = 0x80;
const EMPTY_SPOOL_WEIGHT: usize = 0x84;
const MEASURED_WEIGHT: usize = 0x86;
const MEASURED_LENGTH: usize = 0x88;
const URL: (usize, usize) = (0xA0, 32);

const TEMPERATURE_SCALE: u64 = 5;

fn text(payload: &[u8], offset: usize, len: usize) -> Option<String> {
    let raw = payload.get(offset..offset + len)?;
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    Some(String::from_utf8_lossy(&raw[..end]).trim().to_string())
}

fn u16_at(payload: &[u8], offset: usize) -> Option<u16> {
    payload.get(offset..offset + 2).map(BigEndian::read_u16)
}

/// RGBA block as lowercase hex, `None` when all zero.
fn rgba(payload: &[u8], offset: usize) -> Option<String> {
    let block = payload.get(offset..offset + 4)?;
    if block.iter().all(|&b| b == 0) {
        return None;
    }
    Some(hex_string(block))
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn insert_nonzero(data: &mut TagData, key: &str, value: Option<u64>) {
    if let Some(v) = value.filter(|&v| v != 0) {
        data.insert(key.to_string(), Value::from(v));
    }
}

fn insert_text(data: &mut TagData, key: &str, value: Option<String>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        data.insert(key.to_string(), Value::from(v));
    }
}

fn detect(payload: &[u8]) -> Option<&'static Layout> {
    if payload.len() >= CURRENT.min_len && u16_at(payload, 0) == Some(VERSION_MARKER) {
        return Some(&CURRENT);
    }
    if payload.len() >= LEGACY.min_len
        && payload.get(LEGACY_MARKER_OFFSET..LEGACY_MARKER_OFFSET + 2) == Some(LEGACY_MARKER.as_slice())
    {
        return Some(&LEGACY);
    }
    None
}

/// Decode an OpenTag3D payload into a flat field map.
///
/// Returns `None` when the payload is too short or carries neither marker.
pub fn decode(payload: &[u8]) -> Option<TagData> {
    let layout = detect(payload)?;
    let mut data = Map::new();

    data.insert("layout".to_string(), Value::from(layout.name));
    if layout.extensions {
        data.insert("tag_version".to_string(), Value::from(VERSION_MARKER));
    }

    // Always present so name templates can refer to them
    for (key, offset, len) in [
        ("material_base", layout.base, 5),
        ("material_modifiers", layout.modifiers, 5),
        ("manufacturer", layout.manufacturer, 16),
        ("color_name", layout.color_name, 32),
    ] {
        data.insert(key.to_string(), Value::from(text(payload, offset, len)?));
    }

    if let Some(color) = rgba(payload, layout.color) {
        data.insert("color_hex".to_string(), Value::from(color));
    }
    for (i, &offset) in layout.extra_colors.iter().enumerate() {
        if let Some(color) = rgba(payload, offset) {
            data.insert(format!("color_hex_{}", i + 2), Value::from(color));
        }
    }

    if let Some(um) = u16_at(payload, layout.diameter).filter(|&v| v != 0) {
        data.insert("diameter".to_string(), Value::from(f64::from(um) / 1000.0));
    }
    insert_nonzero(&mut data, "weight", u16_at(payload, layout.weight).map(u64::from));
    insert_nonzero(
        &mut data,
        "print_temperature",
        payload.get(layout.print_temp).map(|&t| u64::from(t) * TEMPERATURE_SCALE),
    );
    insert_nonzero(
        &mut data,
        "bed_temperature",
        payload.get(layout.bed_temp).map(|&t| u64::from(t) * TEMPERATURE_SCALE),
    );
    if let Some(density) = u16_at(payload, layout.density).filter(|&v| v != 0) {
        data.insert("density".to_string(), Value::from(f64::from(density) / 1000.0));
    }

    if layout.extensions {
        decode_extensions(payload, &mut data);
    }
    Some(data)
}

fn decode_extensions(payload: &[u8], data: &mut TagData) {
    insert_text(data, "serial", text(payload, SERIAL.0, SERIAL.1));

    if let Some(date) = payload.get(MANUFACTURE_DATE..MANUFACTURE_DATE + 4) {
        let year = BigEndian::read_u16(&date[..2]);
        let (month, day) = (date[2], date[3]);
        if year != 0 && (1..=12).contains(&month) && (1..=31).contains(&day) {
            data.insert(
                "manufacture_date".to_string(),
                Value::from(format!("{:04}-{:02}-{:02}", year, month, day)),
            );
        }
    }

    insert_nonzero(data, "empty_spool_weight", u16_at(payload, EMPTY_SPOOL_WEIGHT).map(u64::from));
    insert_nonzero(data, "measured_weight", u16_at(payload, MEASURED_WEIGHT).map(u64::from));
    insert_nonzero(data, "measured_length", u16_at(payload, MEASURED_LENGTH).map(u64::from));
    insert_text(data, "url", text(payload, URL.0, URL.1));
}

/// First six hex digits, the inventory's color format.
fn rgb(color: &Value) -> Option<String> {
    color.as_str().and_then(|c| c.get(..6)).map(str::to_string)
}

fn build_plan(settings: &ImportSettings, tag: &TagData) -> Option<ImportPlan> {
    let vendor = tag.get("manufacturer").and_then(Value::as_str).filter(|s| !s.is_empty())?;
    let material = tag.get("material_base").and_then(Value::as_str).filter(|s| !s.is_empty())?;
    let template = settings.name_template.as_deref().unwrap_or(DEFAULT_OPENTAG3D_NAME_TEMPLATE);

    let mut filament = Map::new();
    filament.insert(
        "density".to_string(),
        tag.get("density").cloned().unwrap_or_else(|| Value::from(DEFAULT_DENSITY)),
    );
    for (target, source) in [("diameter", "diameter"), ("weight", "weight")] {
        if let Some(value) = tag.get(source) {
            filament.insert(target.to_string(), value.clone());
        }
    }
    if let Some(color) = tag.get("color_hex").and_then(rgb) {
        filament.insert("color_hex".to_string(), Value::from(color));
    }
    let extra: Vec<String> = (2..=4)
        .filter_map(|i| tag.get(&format!("color_hex_{}", i)).and_then(rgb))
        .collect();
    if !extra.is_empty() {
        filament.insert("multi_color_hexes".to_string(), Value::from(extra.join(",")));
    }

    let mut filament_defaults = Map::new();
    for (target, source) in [
        ("settings_extruder_temp", "print_temperature"),
        ("settings_bed_temp", "bed_temperature"),
        ("spool_weight", "empty_spool_weight"),
    ] {
        if let Some(value) = tag.get(source) {
            filament_defaults.insert(target.to_string(), value.clone());
        }
    }

    let mut spool_defaults = Map::new();
    if let Some(weight) = tag.get("measured_weight").or_else(|| tag.get("weight")) {
        spool_defaults.insert("initial_weight".to_string(), weight.clone());
        spool_defaults.insert("remaining_weight".to_string(), weight.clone());
    }
    if let Some(serial) = tag.get("serial") {
        spool_defaults.insert("lot_nr".to_string(), serial.clone());
    }

    Some(ImportPlan {
        vendor: vendor.to_string(),
        empty_spool_weight: tag.get("empty_spool_weight").and_then(Value::as_f64),
        material: material.to_string(),
        filament_name: filament_name(template, tag),
        filament,
        filament_defaults,
        spool_defaults,
    })
}

/// Resolves OpenTag3D cards, creating inventory entries when needed.
pub struct OpenTag3dParser {
    inventory: Arc<dyn Inventory>,
    settings: ImportSettings,
}

impl OpenTag3dParser {
    pub fn new(inventory: Arc<dyn Inventory>, settings: ImportSettings) -> Self {
        Self { inventory, settings }
    }
}

impl TagParser for OpenTag3dParser {
    fn name(&self) -> &'static str {
        "opentag3d"
    }

    fn parse(&self, event: &ReadEvent) -> TagIds {
        let Some(memory) = event.memory() else {
            return TagIds::empty();
        };
        let Ok(records) = ndef::read_message(memory) else {
            return TagIds::empty();
        };
        let Some(record) = ndef::find_record(&records, OPENTAG3D_MIME_TYPE) else {
            return TagIds::empty();
        };
        let Some(tag) = decode(record.payload(memory)) else {
            debug!(identifier = %event.identifier, "OpenTag3D record without a known layout");
            return TagIds::empty();
        };
        let Some(plan) = build_plan(&self.settings, &tag) else {
            debug!(identifier = %event.identifier, "OpenTag3D tag without manufacturer or material");
            return TagIds::empty();
        };

        match import_spool(self.inventory.as_ref(), &self.settings, &tag, plan, &event.identifier) {
            Ok((spool, filament)) => TagIds::new(spool.to_string(), filament.to_string()),
            Err(e) => {
                warn!(identifier = %event.identifier, error = %e, "failed to import OpenTag3D spool");
                TagIds::empty()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) {
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn current_payload() -> Vec<u8> {
        let mut p = vec![0u8; 0x64];
        put(&mut p, 0x00, &[0x00, 0x01]);
        put(&mut p, 0x02, b"PLA\0\0");
        put(&mut p, 0x07, b"Silk\0");
        put(&mut p, 0x1B, b"Acme");
        put(&mut p, 0x2B, b"Fire Red");
        put(&mut p, 0x4B, &[0xFF, 0x00, 0x00, 0xFF]);
        put(&mut p, 0x5C, &1750u16.to_be_bytes());
        put(&mut p, 0x5E, &1000u16.to_be_bytes());
        p[0x60] = 42;
        p[0x61] = 12;
        put(&mut p, 0x62, &1240u16.to_be_bytes());
        p
    }

    #[test]
    fn test_current_layout() {
        let data = decode(&current_payload()).unwrap();
        assert_eq!(data["material_base"], json!("PLA"));
        assert_eq!(data["color_hex"], json!("ff0000ff"));
        assert_eq!(data["material_modifiers"], json!("Silk"));
        assert_eq!(data["manufacturer"], json!("Acme"));
        assert_eq!(data["diameter"], json!(1.75));
        assert_eq!(data["weight"], json!(1000));
        assert_eq!(data["print_temperature"], json!(210));
        assert_eq!(data["bed_temperature"], json!(60));
        assert_eq!(data["density"], json!(1.24));
        assert!(!data.contains_key("color_hex_2"));
        assert!(!data.contains_key("serial"));
    }

    #[test]
    fn test_extensions_only_when_long_enough() {
        let mut p = current_payload();
        p.resize(0x84, 0);
        put(&mut p, 0x70, b"LOT-77");
        put(&mut p, 0x80, &[0x07, 0xE8, 3, 14]);
        let data = decode(&p).unwrap();
        assert_eq!(data["serial"], json!("LOT-77"));
        assert_eq!(data["manufacture_date"], json!("2024-03-14"));
        assert!(!data.contains_key("empty_spool_weight"));
    }

    #[test]
    fn test_legacy_layout() {
        let mut p = vec![0u8; 0x58];
        put(&mut p, 0x10, b"OT");
        put(&mut p, 0x12, b"PETG\0");
        put(&mut p, 0x1C, b"Acme");
        put(&mut p, 0x4C, &[0x00, 0x00, 0xFF, 0xFF]);
        put(&mut p, 0x50, &2850u16.to_be_bytes());
        let data = decode(&p).unwrap();
        assert_eq!(data["layout"], json!("legacy"));
        assert_eq!(data["material_base"], json!("PETG"));
        assert_eq!(data["color_hex"], json!("0000ffff"));
        assert_eq!(data["diameter"], json!(2.85));
    }

    #[test]
    fn test_rejects_short_or_unmarked() {
        assert!(decode(&current_payload()[..0x63]).is_none());
        let mut p = current_payload();
        p[1] = 0x02;
        assert!(decode(&p).is_none());
        assert!(decode(&[]).is_none());
    }

    #[test]
    fn test_plan_from_tag() {
        let data = decode(&current_payload()).unwrap();
        let plan = build_plan(&ImportSettings::default(), &data).unwrap();
        assert_eq!(plan.vendor, "Acme");
        assert_eq!(plan.material, "PLA");
        assert_eq!(plan.filament_name, "PLA Silk - Fire Red");
        assert_eq!(plan.filament["color_hex"], json!("ff0000"));
        assert_eq!(plan.filament_defaults["settings_extruder_temp"], json!(210));
        assert_eq!(plan.spool_defaults["initial_weight"], json!(1000));
    }
}
