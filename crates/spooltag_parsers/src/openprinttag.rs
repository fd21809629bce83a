//! OpenPrintTag cards: the main region of the record codec, imported into
//! the inventory.

use crate::chain::TagParser;
use crate::import::{average_temperature, filament_name, import_spool, ImportPlan, ImportSettings, TagData};
use crate::inventory::Inventory;
use serde_json::{Map, Value};
use spooltag_protocol::defaults::{DEFAULT_DENSITY, DEFAULT_FILAMENT_NAME_TEMPLATE};
use spooltag_protocol::{ReadEvent, TagIds};
use spooltag_record::{FieldMap, Record, RecordConfig, RegionKind};
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SECONDARY_COLORS: usize = 5;

/// Main region fields as a JSON object.
pub fn tag_data(fields: &FieldMap) -> TagData {
    fields
        .iter()
        .filter_map(|(name, value)| serde_json::to_value(value).ok().map(|v| (name.clone(), v)))
        .collect()
}

fn strip_hash(color: &Value) -> Option<String> {
    color.as_str().map(|c| c.trim_start_matches('#').to_string())
}

/// Density from weight (g), length (mm) and diameter (mm).
fn computed_density(tag: &TagData) -> Option<f64> {
    let weight = tag.get("actual_netto_full_weight")?.as_f64()?;
    let length_cm = tag.get("actual_full_length")?.as_f64()? / 10.0;
    let diameter = tag.get("filament_diameter")?.as_f64()?;
    let density = weight / (length_cm * (diameter / 20.0).powi(2) * PI);
    density.is_finite().then_some(density)
}

fn build_plan(settings: &ImportSettings, tag: &TagData) -> Option<ImportPlan> {
    let text = |name: &str| tag.get(name).and_then(Value::as_str).filter(|s| !s.is_empty());
    let vendor = text("brand_name")?;
    let material = text("material_type")?;
    let template = settings.name_template.as_deref().unwrap_or(DEFAULT_FILAMENT_NAME_TEMPLATE);

    let mut filament = Map::new();
    let density = tag
        .get("density")
        .cloned()
        .or_else(|| computed_density(tag).map(Value::from))
        .unwrap_or_else(|| Value::from(DEFAULT_DENSITY));
    filament.insert("density".to_string(), density);
    if let Some(diameter) = tag.get("filament_diameter") {
        filament.insert("diameter".to_string(), diameter.clone());
    }
    if let Some(color) = tag.get("primary_color").and_then(strip_hash) {
        filament.insert("color_hex".to_string(), Value::from(color));
    }
    let secondary: Vec<String> = (0..SECONDARY_COLORS)
        .filter_map(|i| tag.get(&format!("secondary_color_{}", i)).and_then(strip_hash))
        .collect();
    if !secondary.is_empty() {
        filament.insert("multi_color_hexes".to_string(), Value::from(secondary.join(",")));
    }

    let mut filament_defaults = Map::new();
    for (target, source) in [
        ("remaining_weight", "nominal_netto_full_weight"),
        ("spool_weight", "empty_container_weight"),
        ("article_number", "gtin"),
    ] {
        if let Some(value) = tag.get(source) {
            filament_defaults.insert(target.to_string(), value.clone());
        }
    }
    if let Some(temp) = average_temperature(tag, "min_print_temperature", "max_print_temperature") {
        filament_defaults.insert("settings_extruder_temp".to_string(), Value::from(temp));
    }
    if let Some(temp) = average_temperature(tag, "min_bed_temperature", "max_bed_temperature") {
        filament_defaults.insert("settings_bed_temp".to_string(), Value::from(temp));
    }

    let mut spool_defaults = Map::new();
    if let Some(weight) = tag.get("actual_netto_full_weight") {
        spool_defaults.insert("remaining_weight".to_string(), weight.clone());
        spool_defaults.insert("initial_weight".to_string(), weight.clone());
    }

    Some(ImportPlan {
        vendor: vendor.to_string(),
        empty_spool_weight: tag.get("empty_container_weight").and_then(Value::as_f64),
        material: material.to_string(),
        filament_name: filament_name(template, tag),
        filament,
        filament_defaults,
        spool_defaults,
    })
}

pub struct OpenPrintTagParser {
    inventory: Arc<dyn Inventory>,
    settings: ImportSettings,
    config: Arc<RecordConfig>,
}

impl OpenPrintTagParser {
    pub fn new(inventory: Arc<dyn Inventory>, settings: ImportSettings, config: Arc<RecordConfig>) -> Self {
        Self {
            inventory,
            settings,
            config,
        }
    }

    fn read_main(&self, memory: &[u8]) -> Option<TagData> {
        let record = match Record::new(self.config.clone(), memory.to_vec()) {
            Ok(record) => record,
            Err(e) => {
                debug!(error = %e, "not an OpenPrintTag card");
                return None;
            }
        };
        match record.read(RegionKind::Main) {
            Ok(fields) if !fields.is_empty() => Some(tag_data(&fields)),
            Ok(_) => {
                debug!("OpenPrintTag main region is empty");
                None
            }
            Err(e) => {
                debug!(error = %e, "unreadable OpenPrintTag main region");
                None
            }
        }
    }
}

impl TagParser for OpenPrintTagParser {
    fn name(&self) -> &'static str {
        "openprinttag"
    }

    fn parse(&self, event: &ReadEvent) -> TagIds {
        let Some(tag) = event.memory().and_then(|memory| self.read_main(memory)) else {
            return TagIds::empty();
        };
        let Some(plan) = build_plan(&self.settings, &tag) else {
            debug!(identifier = %event.identifier, "OpenPrintTag card without brand or material type");
            return TagIds::empty();
        };
        info!(name = %plan.filament_name, "filament name from template");

        match import_spool(self.inventory.as_ref(), &self.settings, &tag, plan, &event.identifier) {
            Ok((spool, filament)) => TagIds::new(spool.to_string(), filament.to_string()),
            Err(e) => {
                warn!(identifier = %event.identifier, error = %e, "failed to import OpenPrintTag spool");
                TagIds::empty()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tag(value: Value) -> TagData {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_plan_defaults() {
        let data = tag(json!({
            "brand_name": "Prusament",
            "material_type": "PLA",
            "material_name": "Galaxy Black",
            "filament_diameter": 1.75,
            "primary_color": "#3d3e3d",
            "secondary_color_1": "#ffffffff",
            "nominal_netto_full_weight": 1000,
            "gtin": 8594173675001u64,
            "min_print_temperature": 205,
            "max_print_temperature": 225,
            "max_bed_temperature": 60
        }));
        let plan = build_plan(&ImportSettings::default(), &data).unwrap();
        assert_eq!(plan.filament_name, "PLA Galaxy Black");
        assert_eq!(plan.filament["density"], json!(DEFAULT_DENSITY));
        assert_eq!(plan.filament["color_hex"], json!("3d3e3d"));
        assert_eq!(plan.filament["multi_color_hexes"], json!("ffffffff"));
        assert_eq!(plan.filament_defaults["article_number"], json!(8594173675001u64));
        assert_eq!(plan.filament_defaults["settings_extruder_temp"], json!(215));
        assert_eq!(plan.filament_defaults["settings_bed_temp"], json!(60));
        assert!(plan.spool_defaults.is_empty());
    }

    #[test]
    fn test_density_from_weight_and_length() {
        let data = tag(json!({
            "actual_netto_full_weight": 1000.0,
            "actual_full_length": 330000.0,
            "filament_diameter": 1.75
        }));
        let density = computed_density(&data).unwrap();
        assert!((density - 1.26).abs() < 0.01, "{}", density);
    }

    #[test]
    fn test_missing_brand_is_not_importable() {
        let data = tag(json!({"material_type": "PLA"}));
        assert!(build_plan(&ImportSettings::default(), &data).is_none());
    }
}
