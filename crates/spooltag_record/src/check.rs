//! Semantic checks of an OpenPrintTag main region.

use crate::error::Result;
use crate::fields::{FieldMap, FieldValue, ItemTable};
use crate::record::Record;
use crate::region::RegionKind;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

const BRAND_NAMESPACE: Uuid = Uuid::from_u128(0x5269dfb7_1559_440a_85be_aba5f3eff2d2);
const MATERIAL_NAMESPACE: Uuid = Uuid::from_u128(0x616fc86d_7d99_4953_96c7_46d2836b9be9);
const PACKAGE_NAMESPACE: Uuid = Uuid::from_u128(0x6f7d485e_db8d_4979_904e_a231cd6602b2);
const INSTANCE_NAMESPACE: Uuid = Uuid::from_u128(0x31062f81_b5bd_4f86_a5f8_46367e841508);

/// First byte of an NFC-V UID in transmission order.
const NFCV_UID_PREFIX: u8 = 0xE0;

/// Smallest aux region worth having.
const MIN_AUX_SIZE: usize = 16;

/// Field groups whose values must be non-decreasing in list order.
const ORDERED_FIELDS: &[&[&str]] = &[
    &["nominal_netto_full_weight", "actual_netto_full_weight"],
    &["nominal_full_length", "actual_full_length"],
    &["preheat_temperature", "min_print_temperature", "max_print_temperature"],
    &["min_bed_temperature", "max_bed_temperature"],
    &["min_chamber_temperature", "chamber_temperature", "max_chamber_temperature"],
    &["container_hole_diameter", "container_inner_diameter", "container_outer_diameter"],
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckReport {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub notes: Vec<String>,
    pub uuids: BTreeMap<String, Option<String>>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Explicit UUID from the data, else the derived one.
    fn deduce(&mut self, main: &FieldMap, field: &str, generated: Option<Uuid>, report_failure: bool) -> Option<Uuid> {
        let explicit = main.get(field).and_then(FieldValue::as_str).and_then(|s| Uuid::parse_str(s).ok());

        let result = match (explicit, generated) {
            (Some(explicit), Some(generated)) if explicit == generated => {
                self.warnings.push(format!(
                    "{} is identical to the auto-generated version, and thus can be omitted to save space",
                    field
                ));
                Some(explicit)
            }
            (Some(explicit), Some(generated)) => {
                self.notes
                    .push(format!("{} ({}) differs from auto-generated {}", field, explicit, generated));
                Some(explicit)
            }
            (Some(explicit), None) => Some(explicit),
            (None, Some(generated)) => Some(generated),
            (None, None) => {
                if report_failure {
                    self.errors.push(format!("Failed to deduce {}", field));
                }
                None
            }
        };

        self.uuids.insert(field.to_string(), result.map(|u| u.to_string()));
        result
    }
}

fn text<'a>(main: &'a FieldMap, name: &str) -> Option<&'a str> {
    main.get(name).and_then(FieldValue::as_str)
}

fn v5(namespace: &Uuid, parts: &[&[u8]]) -> Uuid {
    Uuid::new_v5(namespace, &parts.concat())
}

/// Check the main region for consistency and derive the tag's UUIDs.
///
/// `tag_uid` is the NFC-V UID in transmission order (starting with `0xE0`).
pub fn semantic_check(record: &Record, tag_uid: Option<&[u8]>) -> Result<CheckReport> {
    let mut report = CheckReport::default();
    let main = record.read(RegionKind::Main)?;

    match record.region(RegionKind::Aux) {
        None => report.warnings.push("Aux region not present".to_string()),
        Some(aux) if aux.len() < MIN_AUX_SIZE => report
            .warnings
            .push("Aux region is smaller than 16 bytes".to_string()),
        Some(_) => {}
    }

    if let Some(schema) = record.config().schema(RegionKind::Main) {
        let required = schema.validate(&main);
        report.errors.extend(required.errors);
        report.warnings.extend(required.warnings);

        check_tags(&mut report, &main, schema.field_by_name("tags").and_then(|f| f.kind.items()));
    }

    for group in ORDERED_FIELDS {
        check_order(&mut report, &main, group);
    }

    let brand = text(&main, "brand_name").map(|name| v5(&BRAND_NAMESPACE, &[name.as_bytes()]));
    let brand_uuid = report.deduce(&main, "brand_uuid", brand, true);

    let material = match (brand_uuid, text(&main, "material_name")) {
        (Some(brand), Some(name)) => Some(v5(&MATERIAL_NAMESPACE, &[brand.as_bytes(), name.as_bytes()])),
        _ => None,
    };
    report.deduce(&main, "material_uuid", material, true);

    let gtin = main.get("gtin").map(|g| g.to_string());
    let package = match (brand_uuid, gtin) {
        (Some(brand), Some(gtin)) => Some(v5(&PACKAGE_NAMESPACE, &[brand.as_bytes(), gtin.as_bytes()])),
        _ => None,
    };
    report.deduce(&main, "package_uuid", package, true);

    let mut instance = None;
    if let Some(uid) = tag_uid {
        if uid.first() != Some(&NFCV_UID_PREFIX) {
            report
                .warnings
                .push(format!("Tag UID {} doesn't start with 0xE0", hex::encode(uid)));
        } else if brand_uuid.is_some() {
            instance = Some(v5(&INSTANCE_NAMESPACE, &[uid]));
        }
    }
    report.deduce(&main, "instance_uuid", instance, false);

    Ok(report)
}

fn check_tags(report: &mut CheckReport, main: &FieldMap, items: Option<&ItemTable>) {
    let (Some(items), Some(FieldValue::List(tags))) = (items, main.get("tags")) else {
        return;
    };
    let present: Vec<&str> = tags.iter().filter_map(FieldValue::as_str).collect();

    for tag in &present {
        for implied in items.item_names(tag, "implies") {
            if !present.contains(&implied.as_str()) {
                report
                    .errors
                    .push(format!("Tag '{}' present but implied tag '{}' not", tag, implied));
            }
        }
        for hint in items.item_names(tag, "hints") {
            if !present.contains(&hint.as_str()) {
                report
                    .notes
                    .push(format!("Consider adding tag '{}' (hinted by '{}')", hint, tag));
            }
        }
    }
}

fn check_order(report: &mut CheckReport, main: &FieldMap, fields: &[&str]) {
    for (i, a) in fields.iter().enumerate() {
        for b in &fields[i + 1..] {
            let (Some(va), Some(vb)) = (main.get(*a), main.get(*b)) else {
                continue;
            };
            let (Some(x), Some(y)) = (va.as_f64(), vb.as_f64()) else {
                continue;
            };
            if x > y {
                report
                    .errors
                    .push(format!("Fields {} ({}), {} ({}): a <= b", a, va, b, vb));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecordConfig;
    use crate::initialize::{initialize_record, InitOptions};
    use std::sync::Arc;

    fn record_with(fields: &[(&str, FieldValue)], aux: Option<usize>) -> Record {
        let config = Arc::new(RecordConfig::builtin().unwrap());
        let mut options = InitOptions::new(320);
        options.aux_region = aux;
        let image = initialize_record(&config, &options).unwrap();
        let mut record = Record::new(config, image).unwrap();
        let map: FieldMap = fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        record.write(RegionKind::Main, &map).unwrap();
        record
    }

    fn text_value(s: &str) -> FieldValue {
        FieldValue::Text(s.to_string())
    }

    #[test]
    fn test_brand_uuid_derivation() {
        let record = record_with(
            &[
                ("material_class", text_value("FFF")),
                ("brand_name", text_value("Prusament")),
                ("material_name", text_value("PLA Galaxy Black")),
                ("gtin", FieldValue::Int(8594173675001)),
            ],
            Some(32),
        );
        let report = semantic_check(&record, None).unwrap();

        let brand = v5(&BRAND_NAMESPACE, &[b"Prusament"]);
        assert_eq!(report.uuids["brand_uuid"], Some(brand.to_string()));

        let material = v5(&MATERIAL_NAMESPACE, &[brand.as_bytes(), b"PLA Galaxy Black"]);
        assert_eq!(report.uuids["material_uuid"], Some(material.to_string()));

        let package = v5(&PACKAGE_NAMESPACE, &[brand.as_bytes(), b"8594173675001"]);
        assert_eq!(report.uuids["package_uuid"], Some(package.to_string()));

        assert_eq!(report.uuids["instance_uuid"], None);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
    }

    #[test]
    fn test_explicit_uuid_equal_to_derived_is_flagged() {
        let brand = v5(&BRAND_NAMESPACE, &[b"Acme"]);
        let record = record_with(
            &[
                ("material_class", text_value("FFF")),
                ("brand_name", text_value("Acme")),
                ("brand_uuid", text_value(&brand.to_string())),
            ],
            Some(32),
        );
        let report = semantic_check(&record, Some(&[0xE0, 0x04, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06])).unwrap();
        assert!(report
            .warnings
            .iter()
            .any(|w| w.starts_with("brand_uuid is identical")));
        assert!(report.uuids["instance_uuid"].is_some());
        // No material name or gtin
        assert!(report.errors.contains(&"Failed to deduce material_uuid".to_string()));
    }

    #[test]
    fn test_relations_tags_and_aux() {
        let record = record_with(
            &[
                ("material_class", text_value("FFF")),
                ("min_print_temperature", FieldValue::Int(230)),
                ("max_print_temperature", FieldValue::Int(210)),
                (
                    "tags",
                    FieldValue::List(vec![text_value("contains_carbon_fiber"), text_value("contains_carbon")]),
                ),
            ],
            None,
        );
        let report = semantic_check(&record, Some(&[0x04, 0x01])).unwrap();

        assert!(report.warnings.contains(&"Aux region not present".to_string()));
        assert!(report
            .warnings
            .contains(&"Tag UID 0401 doesn't start with 0xE0".to_string()));
        assert!(report.errors.contains(
            &"Fields min_print_temperature (230), max_print_temperature (210): a <= b".to_string()
        ));
        assert!(report
            .errors
            .contains(&"Tag 'contains_carbon_fiber' present but implied tag 'abrasive' not".to_string()));
        assert!(!report.is_ok());
    }

    #[test]
    fn test_small_aux_warning() {
        let record = record_with(&[("material_class", text_value("FFF"))], Some(8));
        let report = semantic_check(&record, None).unwrap();
        assert!(report
            .warnings
            .contains(&"Aux region is smaller than 16 bytes".to_string()));
    }
}
