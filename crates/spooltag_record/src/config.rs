//! Record configuration: card root type, payload MIME type and the field
//! schema of each region.

use crate::error::{RecordError, Result};
use crate::fields::FieldSchema;
use crate::region::RegionKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// How the payload is found inside raw card memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootKind {
    /// The whole buffer is the payload
    None,
    /// CC + TLV + NDEF message; the payload is the matching MIME record
    Nfcv,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    root: RootKind,
    mime_type: Option<String>,
    meta_fields: Option<String>,
    main_fields: String,
    aux_fields: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RecordConfig {
    pub root: RootKind,
    pub mime_type: String,
    pub meta: Option<Arc<FieldSchema>>,
    pub main: Arc<FieldSchema>,
    pub aux: Option<Arc<FieldSchema>>,
}

const BUILTIN_CONFIG: &str = include_str!("../data/openprinttag.yaml");

fn builtin_file(name: &str) -> Result<String> {
    let text = match name {
        "meta_fields.yaml" => include_str!("../data/meta_fields.yaml"),
        "main_fields.yaml" => include_str!("../data/main_fields.yaml"),
        "aux_fields.yaml" => include_str!("../data/aux_fields.yaml"),
        "material_class_enum.yaml" => include_str!("../data/material_class_enum.yaml"),
        "material_type_enum.yaml" => include_str!("../data/material_type_enum.yaml"),
        "tags_enum.yaml" => include_str!("../data/tags_enum.yaml"),
        other => return Err(RecordError::Schema(format!("no built-in file '{}'", other))),
    };
    Ok(text.to_string())
}

impl RecordConfig {
    /// The OpenPrintTag schema set compiled into the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_CONFIG, &builtin_file)
    }

    /// Load a configuration file; schema and item files are resolved
    /// relative to its directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let read = move |name: &str| -> Result<String> { Ok(std::fs::read_to_string(dir.join(name))?) };
        Self::from_yaml(&text, &read)
    }

    pub fn from_yaml(text: &str, load: &dyn Fn(&str) -> Result<String>) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(text)?;
        let schema = |name: &str| -> Result<Arc<FieldSchema>> {
            Ok(Arc::new(FieldSchema::from_yaml(&load(name)?, |items| load(items))?))
        };

        let mime_type = match (file.root, file.mime_type) {
            (_, Some(mime)) => mime,
            (RootKind::None, None) => String::new(),
            (RootKind::Nfcv, None) => {
                return Err(RecordError::Schema("mime_type is required for nfcv records".to_string()))
            }
        };

        Ok(Self {
            root: file.root,
            mime_type,
            meta: file.meta_fields.as_deref().map(schema).transpose()?,
            main: schema(&file.main_fields)?,
            aux: file.aux_fields.as_deref().map(schema).transpose()?,
        })
    }

    pub fn schema(&self, kind: RegionKind) -> Option<&Arc<FieldSchema>> {
        match kind {
            RegionKind::Meta => self.meta.as_ref(),
            RegionKind::Main => Some(&self.main),
            RegionKind::Aux => self.aux.as_ref(),
        }
    }
}
