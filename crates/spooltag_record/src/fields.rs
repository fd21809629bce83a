//! Typed field schema.
//!
//! A schema maps small integer CBOR keys to named, typed fields. Field
//! definitions are loaded from YAML and never change afterwards. Values
//! cross the API as [`FieldValue`], a YAML/JSON-friendly shape; on the card
//! they are CBOR data items ([`CborValue`]).

use crate::cbor::{self, canonical_decimal, compact_float, CborValue, DecodedMap, EncodeConfig};
use crate::error::{FieldError, RecordError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Number(f64),
    Text(String),
    List(Vec<FieldValue>),
    Bytes { hex: String },
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(n) => Some(*n as f64),
            FieldValue::Number(f) => Some(*f),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            FieldValue::Bool(_) => "bool".to_string(),
            FieldValue::Int(n) => format!("integer {}", n),
            FieldValue::Number(f) => format!("number {}", f),
            FieldValue::Text(s) => format!("string '{}'", s),
            FieldValue::List(_) => "list".to_string(),
            FieldValue::Bytes { .. } => "bytes".to_string(),
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(n) => write!(f, "{}", n),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            FieldValue::Bytes { hex } => write!(f, "0x{}", hex),
        }
    }
}

/// Field name to value, ordered by name.
pub type FieldMap = BTreeMap<String, FieldValue>;

// ============================================================================
// Field definitions
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRequirement", into = "RawRequirement")]
pub enum Requirement {
    #[default]
    Optional,
    Required,
    Recommended,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawRequirement {
    Flag(bool),
    Level(String),
}

impl TryFrom<RawRequirement> for Requirement {
    type Error = String;

    fn try_from(raw: RawRequirement) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawRequirement::Flag(false) => Ok(Requirement::Optional),
            RawRequirement::Flag(true) => Ok(Requirement::Required),
            RawRequirement::Level(level) if level == "recommended" => Ok(Requirement::Recommended),
            RawRequirement::Level(other) => Err(format!("invalid 'required' value '{}'", other)),
        }
    }
}

impl From<Requirement> for RawRequirement {
    fn from(req: Requirement) -> Self {
        match req {
            Requirement::Optional => RawRequirement::Flag(false),
            Requirement::Required => RawRequirement::Flag(true),
            Requirement::Recommended => RawRequirement::Level("recommended".to_string()),
        }
    }
}

/// Symbolic names for an enum field, loaded from an item file.
#[derive(Debug, Clone, Default)]
pub struct ItemTable {
    by_key: BTreeMap<i64, String>,
    by_name: BTreeMap<String, i64>,
    items: BTreeMap<String, serde_yaml::Mapping>,
}

impl ItemTable {
    /// Build from the item file rows. Deprecated rows are skipped.
    pub fn from_rows(rows: Vec<serde_yaml::Mapping>, index_field: &str, name_field: &str) -> Result<Self> {
        let mut table = ItemTable::default();
        for row in rows {
            let deprecated = row
                .get("deprecated")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if deprecated {
                continue;
            }

            let key = row
                .get(index_field)
                .and_then(|v| v.as_i64())
                .ok_or_else(|| RecordError::Schema(format!("item without integer '{}'", index_field)))?;
            let name = match row.get(name_field) {
                Some(serde_yaml::Value::String(s)) => s.clone(),
                Some(serde_yaml::Value::Number(n)) => n.to_string(),
                _ => {
                    return Err(RecordError::Schema(format!(
                        "item {} without '{}'",
                        key, name_field
                    )))
                }
            };

            if table.by_key.contains_key(&key) {
                return Err(RecordError::Schema(format!("Key '{}' already exists", key)));
            }
            if table.by_name.contains_key(&name) {
                return Err(RecordError::Schema(format!("Item '{}' already exists", name)));
            }

            table.by_key.insert(key, name.clone());
            table.by_name.insert(name.clone(), key);
            table.items.insert(name, row);
        }
        Ok(table)
    }

    pub fn name(&self, key: i64) -> Option<&str> {
        self.by_key.get(&key).map(String::as_str)
    }

    pub fn key(&self, name: &str) -> Option<i64> {
        self.by_name.get(name).copied()
    }

    /// The raw item row, for item attributes such as `implies`.
    pub fn item(&self, name: &str) -> Option<&serde_yaml::Mapping> {
        self.items.get(name)
    }

    /// Names listed under `attribute` of an item (an empty list when absent).
    pub fn item_names(&self, name: &str, attribute: &str) -> Vec<String> {
        self.item(name)
            .and_then(|row| row.get(attribute))
            .and_then(|v| v.as_sequence())
            .map(|seq| seq.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum FieldType {
    Bool,
    Int,
    Number,
    Timestamp,
    String { max_len: usize },
    Enum(ItemTable),
    EnumArray { items: ItemTable, max_len: Option<usize> },
    Bytes { max_len: usize },
    ColorRgba { max_len: usize },
    Uuid,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Bool => "bool",
            FieldType::Int => "int",
            FieldType::Number => "number",
            FieldType::Timestamp => "timestamp",
            FieldType::String { .. } => "string",
            FieldType::Enum(_) => "enum",
            FieldType::EnumArray { .. } => "enum_array",
            FieldType::Bytes { .. } => "bytes",
            FieldType::ColorRgba { .. } => "color_rgba",
            FieldType::Uuid => "uuid",
        }
    }

    pub fn items(&self) -> Option<&ItemTable> {
        match self {
            FieldType::Enum(items) | FieldType::EnumArray { items, .. } => Some(items),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub key: u32,
    pub name: String,
    pub kind: FieldType,
    pub required: Requirement,
}

fn mismatch(expected: &'static str, found: &str) -> FieldError {
    FieldError::TypeMismatch {
        expected,
        found: found.to_string(),
    }
}

fn decode_enum(items: &ItemTable, value: &CborValue) -> std::result::Result<FieldValue, FieldError> {
    let key = value.as_i64().ok_or_else(|| mismatch("integer", value.kind()))?;
    Ok(match items.name(key) {
        Some(name) => FieldValue::Text(name.to_string()),
        None => FieldValue::Int(key),
    })
}

fn encode_enum(items: &ItemTable, value: &FieldValue) -> std::result::Result<CborValue, FieldError> {
    match value {
        FieldValue::Int(n) => Ok(CborValue::integer(*n)),
        FieldValue::Text(name) => items
            .key(name)
            .map(CborValue::integer)
            .ok_or_else(|| FieldError::UnknownItem(name.clone())),
        other => Err(mismatch("item name", &other.describe())),
    }
}

fn parse_hex(text: &str) -> std::result::Result<Vec<u8>, FieldError> {
    hex::decode(text).map_err(|_| FieldError::InvalidHex(text.to_string()))
}

fn check_len(len: usize, max: usize) -> std::result::Result<(), FieldError> {
    if len > max {
        return Err(FieldError::TooLong { len, max });
    }
    Ok(())
}

impl Field {
    /// CBOR data item to field value.
    pub fn decode(&self, value: &CborValue) -> std::result::Result<FieldValue, FieldError> {
        match &self.kind {
            FieldType::Bool => match value {
                CborValue::Bool(b) => Ok(FieldValue::Bool(*b)),
                other => other
                    .as_i64()
                    .map(|n| FieldValue::Bool(n != 0))
                    .ok_or_else(|| mismatch("bool", other.kind())),
            },
            FieldType::Int | FieldType::Timestamp => match value {
                CborValue::Float(f) if f.is_finite() => Ok(FieldValue::Int(f.trunc() as i64)),
                CborValue::Bool(b) => Ok(FieldValue::Int(*b as i64)),
                other => other
                    .as_i64()
                    .map(FieldValue::Int)
                    .ok_or_else(|| mismatch("integer", other.kind())),
            },
            FieldType::Number => {
                let num = value.as_f64().ok_or_else(|| mismatch("number", value.kind()))?;
                if num.fract() == 0.0 && num.abs() < 9.2e18 {
                    Ok(FieldValue::Int(num as i64))
                } else {
                    Ok(FieldValue::Number(canonical_decimal(num)))
                }
            }
            FieldType::String { .. } => match value {
                CborValue::Text(s) => Ok(FieldValue::Text(s.clone())),
                other => Err(mismatch("text", other.kind())),
            },
            FieldType::Enum(items) => decode_enum(items, value),
            FieldType::EnumArray { items, .. } => match value {
                CborValue::Array(elements) => elements
                    .iter()
                    .map(|e| decode_enum(items, e))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map(FieldValue::List),
                other => Err(mismatch("array", other.kind())),
            },
            FieldType::Bytes { .. } => match value {
                CborValue::Bytes(bytes) => Ok(FieldValue::Bytes { hex: hex::encode(bytes) }),
                other => Err(mismatch("bytes", other.kind())),
            },
            FieldType::ColorRgba { .. } => match value {
                CborValue::Bytes(bytes) => Ok(FieldValue::Text(format!("#{}", hex::encode(bytes)))),
                other => Err(mismatch("bytes", other.kind())),
            },
            FieldType::Uuid => match value {
                CborValue::Bytes(bytes) => uuid::Uuid::from_slice(bytes)
                    .map(|u| FieldValue::Text(u.to_string()))
                    .map_err(|e| FieldError::InvalidUuid(e.to_string())),
                other => Err(mismatch("bytes", other.kind())),
            },
        }
    }

    /// Field value to CBOR data item.
    pub fn encode(&self, value: &FieldValue) -> std::result::Result<CborValue, FieldError> {
        match &self.kind {
            FieldType::Bool => match value {
                FieldValue::Bool(b) => Ok(CborValue::Bool(*b)),
                FieldValue::Int(n) => Ok(CborValue::Bool(*n != 0)),
                other => Err(mismatch("bool", &other.describe())),
            },
            FieldType::Int | FieldType::Timestamp => match value {
                FieldValue::Int(n) => Ok(CborValue::integer(*n)),
                FieldValue::Number(f) if f.is_finite() => Ok(CborValue::integer(f.trunc() as i64)),
                FieldValue::Bool(b) => Ok(CborValue::integer(*b as i64)),
                FieldValue::Text(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(CborValue::integer)
                    .map_err(|_| mismatch("integer", &value.describe())),
                other => Err(mismatch("integer", &other.describe())),
            },
            FieldType::Number => match value {
                FieldValue::Int(n) => Ok(compact_float(*n as f64)),
                FieldValue::Number(f) => Ok(compact_float(*f)),
                FieldValue::Text(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(compact_float)
                    .map_err(|_| mismatch("number", &value.describe())),
                other => Err(mismatch("number", &other.describe())),
            },
            FieldType::String { max_len } => {
                let text = match value {
                    FieldValue::Text(s) => s.clone(),
                    FieldValue::Int(n) => n.to_string(),
                    FieldValue::Number(f) => f.to_string(),
                    other => return Err(mismatch("string", &other.describe())),
                };
                check_len(text.len(), *max_len)?;
                Ok(CborValue::Text(text))
            }
            FieldType::Enum(items) => encode_enum(items, value),
            FieldType::EnumArray { items, max_len } => match value {
                FieldValue::List(elements) => {
                    if let Some(max) = max_len {
                        check_len(elements.len(), *max)?;
                    }
                    elements
                        .iter()
                        .map(|e| encode_enum(items, e))
                        .collect::<std::result::Result<Vec<_>, _>>()
                        .map(CborValue::Array)
                }
                other => Err(mismatch("list", &other.describe())),
            },
            FieldType::Bytes { max_len } => {
                let bytes = match value {
                    FieldValue::Bytes { hex } => parse_hex(hex)?,
                    FieldValue::Text(s) => s.as_bytes().to_vec(),
                    FieldValue::Int(n) => {
                        // Little-endian, high zero bytes dropped
                        let mut bytes = n.to_le_bytes().to_vec();
                        while bytes.last() == Some(&0) {
                            bytes.pop();
                        }
                        bytes
                    }
                    FieldValue::List(items) => items
                        .iter()
                        .map(|item| match item {
                            FieldValue::Int(n) => u8::try_from(*n).map_err(|_| mismatch("byte", &item.describe())),
                            other => Err(mismatch("byte", &other.describe())),
                        })
                        .collect::<std::result::Result<Vec<u8>, _>>()?,
                    other => return Err(mismatch("bytes", &other.describe())),
                };
                check_len(bytes.len(), *max_len)?;
                Ok(CborValue::Bytes(bytes))
            }
            FieldType::ColorRgba { max_len } => {
                let bytes = match value {
                    FieldValue::Text(s) => {
                        let digits = s.strip_prefix('#').unwrap_or(s);
                        if digits.len() != 6 && digits.len() != 8 {
                            return Err(FieldError::InvalidColor(s.clone()));
                        }
                        hex::decode(digits).map_err(|_| FieldError::InvalidColor(s.clone()))?
                    }
                    FieldValue::Bytes { hex } => parse_hex(hex)?,
                    other => return Err(mismatch("color", &other.describe())),
                };
                check_len(bytes.len(), *max_len)?;
                Ok(CborValue::Bytes(bytes))
            }
            FieldType::Uuid => match value {
                FieldValue::Text(s) => uuid::Uuid::parse_str(s)
                    .map(|u| CborValue::Bytes(u.as_bytes().to_vec()))
                    .map_err(|e| FieldError::InvalidUuid(e.to_string())),
                other => Err(mismatch("uuid string", &other.describe())),
            },
        }
    }

    fn wrap(&self, source: FieldError) -> RecordError {
        RecordError::Field {
            key: self.key,
            name: self.name.clone(),
            source,
        }
    }
}

// ============================================================================
// Schema
// ============================================================================

#[derive(Debug, Deserialize)]
struct FieldRow {
    key: u32,
    name: String,
    #[serde(rename = "type")]
    type_name: Option<String>,
    #[serde(default)]
    required: Requirement,
    max_length: Option<usize>,
    items_file: Option<String>,
    index_field: Option<String>,
    name_field: Option<String>,
    #[serde(default)]
    deprecated: bool,
}

/// Keys absent from the schema, captured during decode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnknownFields {
    entries: Vec<UnknownField>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnknownField {
    pub key: CborValue,
    pub raw_key: Vec<u8>,
    pub raw_value: Vec<u8>,
}

impl UnknownFields {
    pub fn insert(&mut self, field: UnknownField) {
        self.entries.retain(|e| e.raw_key != field.raw_key);
        self.entries.push(field);
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnknownField> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Changes applied to a region's field map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionUpdate {
    pub fields: FieldMap,
    pub remove: Vec<String>,
    /// Drop all existing content first
    pub clear: bool,
}

impl RegionUpdate {
    pub fn set(fields: FieldMap) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }
}

/// Outcome of [`FieldSchema::validate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    fields: Vec<Field>,
    by_key: BTreeMap<u32, usize>,
    by_name: BTreeMap<String, usize>,
}

impl FieldSchema {
    /// Parse a field list. `load_items` resolves `items_file` names to YAML text.
    pub fn from_yaml<F>(text: &str, load_items: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String>,
    {
        let rows: Vec<FieldRow> = serde_yaml::from_str(text)?;
        let mut schema = FieldSchema::default();

        for row in rows {
            if row.deprecated {
                continue;
            }
            let type_name = row
                .type_name
                .as_deref()
                .ok_or_else(|| RecordError::Schema(format!("Field type not specified for '{}'", row.name)))?;

            let load_table = |row: &FieldRow| -> Result<ItemTable> {
                let file = row.items_file.as_deref().ok_or_else(|| {
                    RecordError::Schema(format!("items_file not specified for '{}'", row.name))
                })?;
                let items: Vec<serde_yaml::Mapping> = serde_yaml::from_str(&load_items(file)?)?;
                ItemTable::from_rows(
                    items,
                    row.index_field.as_deref().unwrap_or("key"),
                    row.name_field.as_deref().unwrap_or("name"),
                )
            };
            let require_len = |row: &FieldRow| {
                row.max_length.ok_or_else(|| {
                    RecordError::Schema(format!("max_length not specified for '{}'", row.name))
                })
            };

            let kind = match type_name {
                "bool" => FieldType::Bool,
                "int" => FieldType::Int,
                "number" => FieldType::Number,
                "timestamp" => FieldType::Timestamp,
                "string" => FieldType::String {
                    max_len: require_len(&row)?,
                },
                "enum" => FieldType::Enum(load_table(&row)?),
                "enum_array" => FieldType::EnumArray {
                    items: load_table(&row)?,
                    max_len: row.max_length,
                },
                "bytes" => FieldType::Bytes {
                    max_len: require_len(&row)?,
                },
                "color_rgba" => FieldType::ColorRgba {
                    max_len: row.max_length.unwrap_or(4),
                },
                "uuid" => FieldType::Uuid,
                other => return Err(RecordError::Schema(format!("Unknown field type '{}'", other))),
            };

            schema.insert(Field {
                key: row.key,
                name: row.name,
                kind,
                required: row.required,
            })?;
        }

        Ok(schema)
    }

    /// Load a field list from a file; item files are resolved next to it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_yaml(&text, |file| Ok(std::fs::read_to_string(dir.join(file))?))
    }

    pub fn insert(&mut self, field: Field) -> Result<()> {
        if self.by_key.contains_key(&field.key) {
            return Err(RecordError::DuplicateKey {
                key: field.key,
                name: field.name,
            });
        }
        if self.by_name.contains_key(&field.name) {
            return Err(RecordError::DuplicateName(field.name));
        }
        let index = self.fields.len();
        self.by_key.insert(field.key, index);
        self.by_name.insert(field.name.clone(), index);
        self.fields.push(field);
        Ok(())
    }

    pub fn field_by_key(&self, key: u32) -> Option<&Field> {
        self.by_key.get(&key).map(|&i| &self.fields[i])
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn known_field(&self, key: &CborValue) -> Option<&Field> {
        key.as_i64()
            .and_then(|k| u32::try_from(k).ok())
            .and_then(|k| self.field_by_key(k))
    }

    /// Decode the CBOR map at the start of `data`.
    ///
    /// Without an `unknown` sink a key missing from the schema is an error.
    pub fn decode(&self, data: &[u8], unknown: Option<&mut UnknownFields>) -> Result<FieldMap> {
        let map = cbor::decode_map(data)?;
        self.decode_entries(data, &map, unknown)
    }

    /// Decode entries already split by [`cbor::decode_map`] over `data`.
    pub fn decode_entries(
        &self,
        data: &[u8],
        map: &DecodedMap,
        mut unknown: Option<&mut UnknownFields>,
    ) -> Result<FieldMap> {
        let mut result = FieldMap::new();
        for entry in &map.entries {
            let field = match self.known_field(&entry.key) {
                Some(field) => field,
                None => match unknown.as_deref_mut() {
                    Some(sink) => {
                        sink.insert(UnknownField {
                            key: entry.key.clone(),
                            raw_key: data[entry.raw_key.clone()].to_vec(),
                            raw_value: data[entry.raw_value.clone()].to_vec(),
                        });
                        continue;
                    }
                    None => return Err(RecordError::UnknownKey(entry.key.to_string())),
                },
            };
            let value = field.decode(&entry.value).map_err(|e| field.wrap(e))?;
            result.insert(field.name.clone(), value);
        }
        Ok(result)
    }

    pub fn encode(&self, fields: &FieldMap, config: EncodeConfig) -> Result<Vec<u8>> {
        self.update(None, &RegionUpdate::set(fields.clone()), config)
    }

    /// Encode `fields` and write the captured unknown entries back verbatim.
    pub fn encode_with_unknown(
        &self,
        fields: &FieldMap,
        unknown: &UnknownFields,
        config: EncodeConfig,
    ) -> Result<Vec<u8>> {
        let mut entries = self.encode_entries(fields, config)?;
        for field in unknown.iter() {
            entries.push((field.raw_key.clone(), field.raw_value.clone()));
        }
        Ok(cbor::encode_raw_map(entries, config))
    }

    fn encode_entries(&self, fields: &FieldMap, config: EncodeConfig) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::with_capacity(fields.len());
        for (name, value) in fields {
            let field = self
                .field_by_name(name)
                .ok_or_else(|| RecordError::UnknownField(name.clone()))?;
            let encoded = field.encode(value).map_err(|e| field.wrap(e))?;
            entries.push(encode_entry(field.key, &encoded, config));
        }
        Ok(entries)
    }

    /// Apply `update` to the map encoded in `original` and re-encode it.
    ///
    /// Known values are re-encoded with compact floats; entries with keys
    /// outside the schema are copied through byte for byte.
    pub fn update(
        &self,
        original: Option<&[u8]>,
        update: &RegionUpdate,
        config: EncodeConfig,
    ) -> Result<Vec<u8>> {
        // (schema key, raw key, raw value) in insertion order
        let mut entries: Vec<(Option<u32>, Vec<u8>, Vec<u8>)> = Vec::new();

        if let Some(data) = original.filter(|_| !update.clear) {
            let map = cbor::decode_map(data)?;
            for entry in map.entries {
                match self.known_field(&entry.key) {
                    Some(field) => {
                        let (raw_key, raw_value) = encode_entry(field.key, &entry.value, config);
                        entries.push((Some(field.key), raw_key, raw_value));
                    }
                    None => entries.push((
                        None,
                        data[entry.raw_key].to_vec(),
                        data[entry.raw_value].to_vec(),
                    )),
                }
            }
        }

        for name in &update.remove {
            let field = self
                .field_by_name(name)
                .ok_or_else(|| RecordError::UnknownField(name.clone()))?;
            entries.retain(|(key, _, _)| *key != Some(field.key));
        }

        for (name, value) in &update.fields {
            let field = self
                .field_by_name(name)
                .ok_or_else(|| RecordError::UnknownField(name.clone()))?;
            let encoded = field.encode(value).map_err(|e| field.wrap(e))?;
            let (raw_key, raw_value) = encode_entry(field.key, &encoded, config);
            match entries.iter_mut().find(|(key, _, _)| *key == Some(field.key)) {
                Some(existing) => existing.2 = raw_value,
                None => entries.push((Some(field.key), raw_key, raw_value)),
            }
        }

        let raw = entries.into_iter().map(|(_, k, v)| (k, v)).collect();
        Ok(cbor::encode_raw_map(raw, config))
    }

    /// Required fields missing are errors, recommended ones warnings.
    pub fn validate(&self, values: &FieldMap) -> ValidationReport {
        let mut report = ValidationReport::default();
        for field in &self.fields {
            if values.contains_key(&field.name) {
                continue;
            }
            match field.required {
                Requirement::Optional => {}
                Requirement::Required => report
                    .errors
                    .push(format!("Missing required field '{}'", field.name)),
                Requirement::Recommended => {
                    warn!(field = %field.name, "missing recommended field");
                    report
                        .warnings
                        .push(format!("Missing recommended field '{}'", field.name))
                }
            }
        }
        report
    }
}

/// Top-level floats always go out compacted, whatever the map framing.
fn encode_entry(key: u32, value: &CborValue, config: EncodeConfig) -> (Vec<u8>, Vec<u8>) {
    let value = match value {
        CborValue::Float(f) => compact_float(*f),
        other => other.clone(),
    };
    (
        cbor::encode(&CborValue::Unsigned(key as u64), config),
        cbor::encode(&value, config),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEMS: &str = r#"
- key: 0
  name: PLA
- key: 1
  name: PETG
- key: 2
  name: OLD
  deprecated: true
"#;

    const FIELDS: &str = r#"
- key: 0
  name: flag
  type: bool
- key: 1
  name: count
  type: int
  required: true
- key: 2
  name: weight
  type: number
  required: recommended
- key: 3
  name: label
  type: string
  max_length: 5
- key: 4
  name: material
  type: enum
  items_file: items.yaml
- key: 5
  name: materials
  type: enum_array
  items_file: items.yaml
  max_length: 2
- key: 6
  name: color
  type: color_rgba
- key: 7
  name: id
  type: uuid
- key: 8
  name: blob
  type: bytes
  max_length: 4
- key: 9
  name: gone
  type: int
  deprecated: true
"#;

    fn schema() -> FieldSchema {
        FieldSchema::from_yaml(FIELDS, |file| {
            assert_eq!(file, "items.yaml");
            Ok(ITEMS.to_string())
        })
        .unwrap()
    }

    fn values(pairs: &[(&str, FieldValue)]) -> FieldMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_schema_loading_skips_deprecated() {
        let schema = schema();
        assert_eq!(schema.len(), 9);
        assert!(schema.field_by_name("gone").is_none());
        assert_eq!(schema.field_by_key(2).unwrap().required, Requirement::Recommended);

        let table = schema.field_by_name("material").unwrap().kind.items().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.key("OLD"), None);
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let yaml = "- {key: 1, name: a, type: int}\n- {key: 1, name: b, type: int}\n";
        let err = FieldSchema::from_yaml(yaml, |_| Ok(String::new())).unwrap_err();
        assert!(matches!(err, RecordError::DuplicateKey { key: 1, .. }));

        let yaml = "- {key: 1, name: a, type: int}\n- {key: 2, name: a, type: int}\n";
        let err = FieldSchema::from_yaml(yaml, |_| Ok(String::new())).unwrap_err();
        assert!(matches!(err, RecordError::DuplicateName(_)));
    }

    #[test]
    fn test_string_requires_max_length() {
        let yaml = "- {key: 1, name: a, type: string}\n";
        assert!(matches!(
            FieldSchema::from_yaml(yaml, |_| Ok(String::new())),
            Err(RecordError::Schema(_))
        ));
    }

    #[test]
    fn test_round_trip_all_types() {
        let schema = schema();
        let input = values(&[
            ("flag", FieldValue::Bool(true)),
            ("count", FieldValue::Int(-7)),
            ("weight", FieldValue::Number(0.3)),
            ("label", FieldValue::Text("abc".to_string())),
            ("material", FieldValue::Text("PETG".to_string())),
            (
                "materials",
                FieldValue::List(vec![FieldValue::Text("PLA".to_string()), FieldValue::Int(9)]),
            ),
            ("color", FieldValue::Text("#ff0000ff".to_string())),
            (
                "id",
                FieldValue::Text("5269dfb7-1559-440a-85be-aba5f3eff2d2".to_string()),
            ),
            ("blob", FieldValue::Bytes { hex: "0102".to_string() }),
        ]);

        let encoded = schema.encode(&input, EncodeConfig::default()).unwrap();
        let decoded = schema.decode(&encoded, None).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_number_decode_rounds_and_collapses() {
        let field = schema().field_by_name("weight").unwrap().clone();
        assert_eq!(field.decode(&CborValue::Float(2.0)).unwrap(), FieldValue::Int(2));
        assert_eq!(
            field.decode(&CborValue::Float(0.30004882)).unwrap(),
            FieldValue::Number(0.3)
        );
    }

    #[test]
    fn test_unknown_enum_key_passes_through() {
        let field = schema().field_by_name("material").unwrap().clone();
        assert_eq!(field.decode(&CborValue::Unsigned(42)).unwrap(), FieldValue::Int(42));
        assert!(matches!(
            field.encode(&FieldValue::Text("NYLON".to_string())),
            Err(FieldError::UnknownItem(_))
        ));
    }

    #[test]
    fn test_encode_limits() {
        let schema = schema();
        let label = schema.field_by_name("label").unwrap();
        assert!(matches!(
            label.encode(&FieldValue::Text("toolong".to_string())),
            Err(FieldError::TooLong { len: 7, max: 5 })
        ));

        let color = schema.field_by_name("color").unwrap();
        assert!(matches!(
            color.encode(&FieldValue::Text("#ff00".to_string())),
            Err(FieldError::InvalidColor(_))
        ));
        assert!(matches!(
            color.encode(&FieldValue::Text("#gg0000".to_string())),
            Err(FieldError::InvalidColor(_))
        ));

        let materials = schema.field_by_name("materials").unwrap();
        let three = FieldValue::List(vec![FieldValue::Int(0); 3]);
        assert!(matches!(materials.encode(&three), Err(FieldError::TooLong { .. })));
    }

    #[test]
    fn test_bytes_from_integer_is_little_endian() {
        let blob = schema().field_by_name("blob").unwrap().clone();
        assert_eq!(
            blob.encode(&FieldValue::Int(0x0102)).unwrap(),
            CborValue::Bytes(vec![0x02, 0x01])
        );
    }

    #[test]
    fn test_unknown_key_without_sink_fails() {
        let schema = schema();
        // {1: 5, 99: "x"}
        let data = [0xa2, 0x01, 0x05, 0x18, 0x63, 0x61, b'x'];
        assert!(matches!(schema.decode(&data, None), Err(RecordError::UnknownKey(_))));

        let mut unknown = UnknownFields::default();
        let decoded = schema.decode(&data, Some(&mut unknown)).unwrap();
        assert_eq!(decoded.get("count"), Some(&FieldValue::Int(5)));
        assert_eq!(unknown.len(), 1);
        let field = unknown.iter().next().unwrap();
        assert_eq!(field.raw_key, vec![0x18, 0x63]);
        assert_eq!(field.raw_value, vec![0x61, b'x']);
    }

    #[test]
    fn test_unknown_fields_preserved_on_reencode() {
        let schema = schema();
        // {1: 5, 99: [1, 2], 100: h'beef'} written by a newer schema
        let data = [
            0xa3, 0x01, 0x05, 0x18, 0x63, 0x82, 0x01, 0x02, 0x18, 0x64, 0x42, 0xbe, 0xef,
        ];
        let mut unknown = UnknownFields::default();
        let decoded = schema.decode(&data, Some(&mut unknown)).unwrap();

        let config = EncodeConfig {
            canonical: true,
            indefinite_containers: false,
        };
        let encoded = schema.encode_with_unknown(&decoded, &unknown, config).unwrap();
        assert_eq!(encoded, data.to_vec());
    }

    #[test]
    fn test_update_keeps_unknown_and_removes() {
        let schema = schema();
        let config = EncodeConfig {
            canonical: false,
            indefinite_containers: false,
        };
        // {1: 5, 2: 1.5, 99: 7}
        let data = [0xa3, 0x01, 0x05, 0x02, 0xf9, 0x3e, 0x00, 0x18, 0x63, 0x07];

        let update = RegionUpdate {
            fields: values(&[("count", FieldValue::Int(6)), ("flag", FieldValue::Bool(false))]),
            remove: vec!["weight".to_string(), "label".to_string()],
            clear: false,
        };
        let encoded = schema.update(Some(&data), &update, config).unwrap();
        assert_eq!(encoded, vec![0xa3, 0x01, 0x06, 0x18, 0x63, 0x07, 0x00, 0xf4]);

        let bad = RegionUpdate {
            remove: vec!["nope".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            schema.update(Some(&data), &bad, config),
            Err(RecordError::UnknownField(_))
        ));

        let cleared = RegionUpdate {
            clear: true,
            ..Default::default()
        };
        assert_eq!(schema.update(Some(&data), &cleared, config).unwrap(), vec![0xa0]);
    }

    #[test]
    fn test_update_compacts_original_doubles() {
        let schema = schema();
        // {2: 0.5 as float64}
        let mut data = vec![0xa1, 0x02, 0xfb];
        data.extend_from_slice(&0.5f64.to_be_bytes());
        let config = EncodeConfig {
            canonical: true,
            indefinite_containers: false,
        };
        let encoded = schema.update(Some(&data), &RegionUpdate::default(), config).unwrap();
        assert_eq!(encoded, vec![0xa1, 0x02, 0xf9, 0x38, 0x00]);
    }

    #[test]
    fn test_validate_requirements() {
        let schema = schema();
        let report = schema.validate(&FieldMap::new());
        assert_eq!(report.errors, vec!["Missing required field 'count'".to_string()]);
        assert_eq!(report.warnings, vec!["Missing recommended field 'weight'".to_string()]);

        let report = schema.validate(&values(&[("count", FieldValue::Int(1))]));
        assert!(report.is_ok());
    }

    #[test]
    fn test_field_value_yaml_shapes() {
        let parsed: FieldMap =
            serde_yaml::from_str("a: 1\nb: 0.5\nc: text\nd: {hex: '0a'}\ne: [x, 2]\nf: true\n").unwrap();
        assert_eq!(parsed["a"], FieldValue::Int(1));
        assert_eq!(parsed["b"], FieldValue::Number(0.5));
        assert_eq!(parsed["c"], FieldValue::Text("text".to_string()));
        assert_eq!(parsed["d"], FieldValue::Bytes { hex: "0a".to_string() });
        assert_eq!(parsed["f"], FieldValue::Bool(true));
        assert!(matches!(parsed["e"], FieldValue::List(_)));
    }
}
