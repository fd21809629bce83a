//! Spool inventory seam.
//!
//! Spools, filaments and vendors are plain JSON objects in the shape the
//! inventory service returns them:
//!
//! ```text
//! spool:    {"id": 1, "filament": {...}, "extra": {"nfc_id": "\"04:a:ff\""}}
//! filament: {"id": 10, "name": "...", "material": "PLA", "vendor": {"id": 3, ...}}
//! vendor:   {"id": 3, "name": "..."}
//! ```
//!
//! The card identifier lives in the spool's `extra.nfc_id` as a JSON string
//! literal, so the stored value carries its own quotes.

use crate::error::{InventoryError, Result};
use serde_json::{json, Map, Value};
use std::sync::Mutex;
use tracing::{debug, info};

/// Value stored in `extra.nfc_id` for a card identifier.
pub fn nfc_id_value(identifier: &str) -> String {
    format!("\"{}\"", identifier.to_lowercase())
}

/// Value stored in `extra.nfc_id` when a spool has no card.
pub const CLEARED_NFC_ID: &str = "\"\"";

pub fn object_id(object: &Value) -> Option<u64> {
    object.get("id").and_then(Value::as_u64)
}

/// Stored card identifier of a spool, lowercased, quotes included.
pub fn spool_nfc_id(spool: &Value) -> Option<String> {
    spool
        .get("extra")
        .and_then(|extra| extra.get("nfc_id"))
        .and_then(Value::as_str)
        .map(str::to_lowercase)
}

/// (spool id, filament id) of a spool object when both are present.
pub fn spool_pair(spool: &Value) -> Option<(u64, u64)> {
    let spool_id = object_id(spool)?;
    let filament_id = spool.get("filament").and_then(object_id)?;
    Some((spool_id, filament_id))
}

pub trait Inventory: Send + Sync {
    fn spools(&self) -> Result<Vec<Value>>;

    fn spool(&self, id: u64) -> Result<Value>;

    /// Merge `extra` into the spool's extra fields.
    fn update_spool_extra(&self, id: u64, extra: Map<String, Value>) -> Result<()>;

    fn find_vendor_by_name(&self, name: &str) -> Result<Option<u64>>;

    fn create_vendor(&self, name: &str, empty_spool_weight: Option<f64>) -> Result<u64>;

    fn find_filament(&self, vendor_id: u64, material: &str, name: &str) -> Result<Option<u64>>;

    fn create_filament(&self, data: Map<String, Value>) -> Result<u64>;

    fn create_spool(&self, data: Map<String, Value>) -> Result<u64>;

    fn find_spool_by_nfc_id(&self, identifier: &str) -> Result<Option<Value>> {
        let wanted = nfc_id_value(identifier);
        Ok(self
            .spools()?
            .into_iter()
            .find(|spool| spool_nfc_id(spool).as_deref() == Some(wanted.as_str())))
    }

    fn clear_nfc_id(&self, spool_id: u64) -> Result<()> {
        let mut extra = Map::new();
        extra.insert("nfc_id".to_string(), Value::String(CLEARED_NFC_ID.to_string()));
        self.update_spool_extra(spool_id, extra)
    }

    /// Attach a card identifier to a spool, detaching it from whichever
    /// spool held it before. Returns false when the update failed.
    fn set_nfc_id(&self, spool_id: u64, identifier: &str) -> Result<bool> {
        if let Some(holder) = self.find_spool_by_nfc_id(identifier)? {
            match object_id(&holder) {
                Some(id) if id == spool_id => {
                    debug!(spool_id, identifier, "identifier already on spool");
                    return Ok(true);
                }
                Some(id) => {
                    info!(from = id, to = spool_id, identifier, "moving identifier between spools");
                    self.clear_nfc_id(id)?;
                }
                None => {}
            }
        }

        let mut extra = Map::new();
        extra.insert("nfc_id".to_string(), Value::String(nfc_id_value(identifier)));
        self.update_spool_extra(spool_id, extra)?;
        Ok(true)
    }
}

// ============================================================================
// In-memory inventory
// ============================================================================

#[derive(Debug, Default)]
struct Tables {
    vendors: Vec<Value>,
    filaments: Vec<Value>,
    spools: Vec<Value>,
}

fn next_id(objects: &[Value]) -> u64 {
    objects.iter().filter_map(object_id).max().unwrap_or(0) + 1
}

/// Inventory kept in memory. Used for mock mode and tests.
#[derive(Debug, Default)]
pub struct MemoryInventory {
    tables: Mutex<Tables>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Three spools, the first two with cards attached.
    pub fn with_sample_data() -> Self {
        let vendors = vec![
            json!({"id": 1, "name": "McGreedy"}),
            json!({"id": 2, "name": "Flaky Inc"}),
            json!({"id": 3, "name": "Too Late Company"}),
        ];
        let filaments = vec![
            json!({"id": 10, "name": "PLA Red", "material": "PLA", "vendor": vendors[0].clone()}),
            json!({"id": 11, "name": "PETG Blue", "material": "PETG", "vendor": vendors[1].clone()}),
            json!({"id": 12, "name": "ABS Black", "material": "ABS", "vendor": vendors[2].clone()}),
        ];
        let spools = vec![
            json!({"id": 1, "filament": filaments[0].clone(), "extra": {"nfc_id": nfc_id_value("aa:bb:cc:dd:0")}}),
            json!({"id": 2, "filament": filaments[1].clone(), "extra": {"nfc_id": nfc_id_value("aa:bb:cc:dd:1")}}),
            json!({"id": 3, "filament": filaments[2].clone(), "extra": {}}),
        ];
        Self {
            tables: Mutex::new(Tables {
                vendors,
                filaments,
                spools,
            }),
        }
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| InventoryError::Request("inventory lock poisoned".to_string()))
    }
}

impl Inventory for MemoryInventory {
    fn spools(&self) -> Result<Vec<Value>> {
        Ok(self.tables()?.spools.clone())
    }

    fn spool(&self, id: u64) -> Result<Value> {
        self.tables()?
            .spools
            .iter()
            .find(|spool| object_id(spool) == Some(id))
            .cloned()
            .ok_or(InventoryError::SpoolNotFound(id))
    }

    fn update_spool_extra(&self, id: u64, extra: Map<String, Value>) -> Result<()> {
        let mut tables = self.tables()?;
        let spool = tables
            .spools
            .iter_mut()
            .find(|spool| object_id(spool) == Some(id))
            .ok_or(InventoryError::SpoolNotFound(id))?;
        let Some(object) = spool.as_object_mut() else {
            return Err(InventoryError::InvalidResponse(format!("spool {} is not an object", id)));
        };
        let current = object
            .entry("extra")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(current) = current.as_object_mut() {
            current.extend(extra);
        }
        Ok(())
    }

    fn find_vendor_by_name(&self, name: &str) -> Result<Option<u64>> {
        Ok(self
            .tables()?
            .vendors
            .iter()
            .find(|vendor| vendor.get("name").and_then(Value::as_str) == Some(name))
            .and_then(object_id))
    }

    fn create_vendor(&self, name: &str, empty_spool_weight: Option<f64>) -> Result<u64> {
        let mut tables = self.tables()?;
        let id = next_id(&tables.vendors);
        let mut vendor = json!({"id": id, "name": name});
        if let Some(weight) = empty_spool_weight {
            vendor["empty_spool_weight"] = json!(weight);
        }
        tables.vendors.push(vendor);
        Ok(id)
    }

    fn find_filament(&self, vendor_id: u64, material: &str, name: &str) -> Result<Option<u64>> {
        Ok(self
            .tables()?
            .filaments
            .iter()
            .find(|filament| {
                filament.get("vendor").and_then(object_id) == Some(vendor_id)
                    && filament.get("material").and_then(Value::as_str) == Some(material)
                    && filament.get("name").and_then(Value::as_str) == Some(name)
            })
            .and_then(object_id))
    }

    fn create_filament(&self, mut data: Map<String, Value>) -> Result<u64> {
        let mut tables = self.tables()?;
        let id = next_id(&tables.filaments);
        if let Some(vendor_id) = data.remove("vendor_id").and_then(|v| v.as_u64()) {
            let vendor = tables
                .vendors
                .iter()
                .find(|vendor| object_id(vendor) == Some(vendor_id))
                .cloned()
                .unwrap_or_else(|| json!({"id": vendor_id}));
            data.insert("vendor".to_string(), vendor);
        }
        data.insert("id".to_string(), json!(id));
        tables.filaments.push(Value::Object(data));
        Ok(id)
    }

    fn create_spool(&self, mut data: Map<String, Value>) -> Result<u64> {
        let mut tables = self.tables()?;
        let id = next_id(&tables.spools);
        let filament_id = data
            .remove("filament_id")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| InventoryError::InvalidResponse("spool needs a filament_id".to_string()))?;
        let filament = tables
            .filaments
            .iter()
            .find(|filament| object_id(filament) == Some(filament_id))
            .cloned()
            .ok_or_else(|| InventoryError::InvalidResponse(format!("filament {} not found", filament_id)))?;
        data.insert("filament".to_string(), filament);
        data.insert("id".to_string(), json!(id));
        tables.spools.push(Value::Object(data));
        Ok(id)
    }
}
