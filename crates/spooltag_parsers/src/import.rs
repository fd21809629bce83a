//! Creating inventory entries from self-describing tags.
//!
//! Decoders that carry full material data (OpenTag3D, OpenPrintTag) find or
//! create the vendor and filament, then create a spool carrying the card's
//! identifier. Which tag fields land where is configurable:
//!
//! ```toml
//! name_template = "{material_type} {material_name}"
//! [filament_fields]
//! "extra.finish" = "material_finish"   # one level of nesting
//! [spool_fields]
//! lot_nr = "serial"
//! ```

use crate::error::Result;
use crate::inventory::{nfc_id_value, Inventory};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Tag data as a flat JSON object keyed by field name.
pub type TagData = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSettings {
    /// Filament name built from `{field}` placeholders.
    #[serde(default)]
    pub name_template: Option<String>,
    /// Inventory filament field => tag field.
    #[serde(default)]
    pub filament_fields: BTreeMap<String, String>,
    /// Inventory spool field => tag field.
    #[serde(default)]
    pub spool_fields: BTreeMap<String, String>,
}

/// What a decoder derived from its tag before the configured mapping.
#[derive(Debug, Clone, Default)]
pub struct ImportPlan {
    pub vendor: String,
    pub empty_spool_weight: Option<f64>,
    pub material: String,
    pub filament_name: String,
    /// Filament fields set before the mapping is applied.
    pub filament: Map<String, Value>,
    /// Filament fields only set when nothing else did.
    pub filament_defaults: Map<String, Value>,
    /// Spool fields only set when nothing else did.
    pub spool_defaults: Map<String, Value>,
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Substitute `{field}` placeholders. `None` when a field is missing or a
/// brace is unbalanced. `{{` and `}}` are literal braces.
pub fn render_template(template: &str, tag: &TagData) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next()? {
                        '}' => break,
                        ch => name.push(ch),
                    }
                }
                out.push_str(&display_value(tag.get(name.trim())?));
            }
            '}' => return None,
            ch => out.push(ch),
        }
    }
    Some(out)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapse whitespace and drop a dangling leading or trailing dash left
/// by empty placeholders.
pub fn clean_name(name: &str) -> String {
    let mut name = collapse_whitespace(name);
    if let Some(rest) = name.strip_suffix('-') {
        name = rest.trim_end().to_string();
    }
    if let Some(rest) = name.strip_prefix('-') {
        name = rest.trim_start().to_string();
    }
    collapse_whitespace(&name)
}

/// Filament name from the template, or the material name when the template
/// cannot be filled.
pub fn filament_name(template: &str, tag: &TagData) -> String {
    match render_template(template, tag) {
        Some(name) => clean_name(&name),
        None => {
            warn!(template, "filament name template could not be filled, using fallback");
            tag.get("material_name")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string()
        }
    }
}

/// Copy mapped tag fields into `base`. A dotted target nests one level.
pub fn apply_mapping(tag: &TagData, mapping: &BTreeMap<String, String>, mut base: Map<String, Value>) -> Map<String, Value> {
    for (target, source) in mapping {
        let Some(value) = tag.get(source) else {
            continue;
        };
        match target.split_once('.') {
            Some((parent, child)) => {
                let entry = base
                    .entry(parent.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !entry.is_object() {
                    *entry = Value::Object(Map::new());
                }
                if let Some(object) = entry.as_object_mut() {
                    object.insert(child.to_string(), value.clone());
                }
            }
            None => {
                base.insert(target.clone(), value.clone());
            }
        }
    }
    base
}

fn fill_defaults(data: &mut Map<String, Value>, defaults: Map<String, Value>) {
    for (key, value) in defaults {
        data.entry(key).or_insert(value);
    }
}

/// Find or create vendor and filament, then create a spool carrying
/// `identifier`. Returns (spool id, filament id).
pub fn import_spool(
    inventory: &dyn Inventory,
    settings: &ImportSettings,
    tag: &TagData,
    plan: ImportPlan,
    identifier: &str,
) -> Result<(u64, u64)> {
    let vendor_id = match inventory.find_vendor_by_name(&plan.vendor)? {
        Some(id) => id,
        None => {
            info!(vendor = %plan.vendor, "creating vendor");
            inventory.create_vendor(&plan.vendor, plan.empty_spool_weight)?
        }
    };

    let filament_id = match inventory.find_filament(vendor_id, &plan.material, &plan.filament_name)? {
        Some(id) => id,
        None => {
            info!(vendor = %plan.vendor, name = %plan.filament_name, "creating filament");
            let mut base = Map::new();
            base.insert("vendor_id".to_string(), Value::from(vendor_id));
            base.insert("name".to_string(), Value::from(plan.filament_name.clone()));
            base.insert("material".to_string(), Value::from(plan.material.clone()));
            base.extend(plan.filament);

            let mut filament = apply_mapping(tag, &settings.filament_fields, base);
            fill_defaults(&mut filament, plan.filament_defaults);
            inventory.create_filament(filament)?
        }
    };

    info!(filament_id, identifier, "creating spool");
    let mut base = Map::new();
    base.insert("filament_id".to_string(), Value::from(filament_id));
    let mut spool = apply_mapping(tag, &settings.spool_fields, base);

    let extra = spool
        .entry("extra")
        .or_insert_with(|| Value::Object(Map::new()));
    if !extra.is_object() {
        *extra = Value::Object(Map::new());
    }
    if let Some(extra) = extra.as_object_mut() {
        extra.insert("nfc_id".to_string(), Value::from(nfc_id_value(identifier)));
    }
    fill_defaults(&mut spool, plan.spool_defaults);

    let spool_id = inventory.create_spool(spool)?;
    info!(spool_id, filament_id, "created spool");
    Ok((spool_id, filament_id))
}

/// Integer average of the two fields, or whichever one is present.
pub fn average_temperature(tag: &TagData, min: &str, max: &str) -> Option<i64> {
    let min = tag.get(min).and_then(Value::as_f64);
    let max = tag.get(max).and_then(Value::as_f64);
    match (min, max) {
        (Some(a), Some(b)) => Some(((a + b) / 2.0) as i64),
        (Some(v), None) | (None, Some(v)) => Some(v as i64),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{spool_pair, MemoryInventory};
    use serde_json::json;

    fn tag(value: Value) -> TagData {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_template_and_cleanup() {
        let data = tag(json!({"material_base": "PLA", "material_modifiers": "", "color_name": "Red"}));
        assert_eq!(
            filament_name("{material_base} {material_modifiers} - {color_name}", &data),
            "PLA - Red"
        );

        let data = tag(json!({"material_base": "PLA", "material_modifiers": "Silk", "color_name": ""}));
        assert_eq!(
            filament_name("{material_base} {material_modifiers} - {color_name}", &data),
            "PLA Silk"
        );
        assert_eq!(clean_name(" - Galaxy   Black "), "Galaxy Black");
    }

    #[test]
    fn test_template_fallback() {
        let data = tag(json!({"material_name": "Galaxy Black"}));
        assert_eq!(filament_name("{brand_name} {material_name}", &data), "Galaxy Black");
        assert_eq!(filament_name("{brand_name}", &TagData::new()), "Unknown");
        assert_eq!(render_template("{{literal}} {a}", &tag(json!({"a": 1.75}))), Some("{literal} 1.75".to_string()));
        assert_eq!(render_template("{unterminated", &TagData::new()), None);
    }

    #[test]
    fn test_mapping_nests_one_level() {
        let data = tag(json!({"serial": "L123", "finish": "matte"}));
        let mapping: BTreeMap<String, String> = [
            ("lot_nr".to_string(), "serial".to_string()),
            ("extra.finish".to_string(), "finish".to_string()),
            ("comment".to_string(), "missing".to_string()),
        ]
        .into_iter()
        .collect();
        let mapped = apply_mapping(&data, &mapping, Map::new());
        assert_eq!(Value::Object(mapped), json!({"lot_nr": "L123", "extra": {"finish": "matte"}}));
    }

    #[test]
    fn test_import_reuses_vendor_and_filament() {
        let inventory = MemoryInventory::with_sample_data();
        let data = tag(json!({"serial": "L1"}));
        let settings = ImportSettings {
            spool_fields: [("lot_nr".to_string(), "serial".to_string())].into_iter().collect(),
            ..Default::default()
        };
        let plan = || ImportPlan {
            vendor: "Acme".to_string(),
            material: "PLA".to_string(),
            filament_name: "PLA Galaxy".to_string(),
            spool_defaults: [("initial_weight".to_string(), json!(1000))].into_iter().collect(),
            ..Default::default()
        };

        let (spool, filament) = import_spool(&inventory, &settings, &data, plan(), "04:A:FF").unwrap();
        let created = inventory.spool(spool).unwrap();
        assert_eq!(created["extra"]["nfc_id"], json!("\"04:a:ff\""));
        assert_eq!(created["lot_nr"], json!("L1"));
        assert_eq!(created["initial_weight"], json!(1000));

        let (second, again) = import_spool(&inventory, &settings, &data, plan(), "04:a:fe").unwrap();
        assert_eq!(again, filament);
        assert_ne!(second, spool);
        assert_eq!(
            spool_pair(&inventory.find_spool_by_nfc_id("04:a:ff").unwrap().unwrap()),
            Some((spool, filament))
        );
    }

    #[test]
    fn test_average_temperature() {
        let data = tag(json!({"min": 200, "max": 215, "only": 60}));
        assert_eq!(average_temperature(&data, "min", "max"), Some(207));
        assert_eq!(average_temperature(&data, "only", "none"), Some(60));
        assert_eq!(average_temperature(&data, "none", "none"), None);
    }
}
