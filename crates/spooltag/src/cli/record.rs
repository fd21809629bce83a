//! `spooltag record ...`: offline OpenPrintTag card image tooling.
//!
//! Images are read from a file or stdin; YAML reports and updated images
//! go to stdout.

use super::{parse_hex, print_yaml, read_image, record_config};
use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use spooltag_record::{
    initialize_record, semantic_check, EncodeConfig, FieldMap, InitOptions, Record, RegionKind,
    RegionUpdate, UnknownFields,
};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    /// Card image; stdin when omitted
    pub file: Option<PathBuf>,

    /// Input is a hex string instead of raw bytes
    #[arg(long)]
    pub unhex: bool,

    /// Record configuration YAML (defaults to the built-in schema)
    #[arg(long)]
    pub schema: Option<PathBuf>,
}

impl InputArgs {
    fn load(&self) -> Result<Record> {
        let image = read_image(self.file.as_deref(), self.unhex)?;
        let config = record_config(self.schema.as_deref())?;
        Record::new(config, image).context("Failed to parse record")
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct InfoOptions {
    /// Region offsets and sizes
    #[arg(short = 'r', long)]
    pub regions: bool,

    /// Tag totals
    #[arg(short = 'u', long)]
    pub root: bool,

    /// Decoded region data
    #[arg(short = 'd', long)]
    pub data: bool,

    /// Raw region bytes as hex
    #[arg(short = 'b', long)]
    pub raw: bool,

    /// Include the meta region with --data / --raw
    #[arg(short = 'm', long)]
    pub meta: bool,

    /// The URI record, if any
    #[arg(short = 'i', long)]
    pub uri: bool,

    /// All of the above
    #[arg(short = 'a', long)]
    pub all: bool,

    /// Check required and recommended fields
    #[arg(long)]
    pub validate: bool,

    /// YAML of `region: [field, ...]` that must be present
    #[arg(short = 'f', long)]
    pub required_fields: Option<PathBuf>,

    /// Semantic checks and UUID derivation
    #[arg(long)]
    pub check: bool,

    /// Tag UID (hex, NFC-V UIDs start with E0) for --check
    #[arg(long)]
    pub uid: Option<String>,
}

impl InfoOptions {
    fn expand(mut self) -> Self {
        if self.all {
            self.regions = true;
            self.root = true;
            self.data = true;
            self.meta = true;
            self.uri = true;
        }
        self
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum RecordAction {
    /// Print information about a record as YAML
    Info {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        options: InfoOptions,
    },
    /// Apply a YAML update (`data:` / `remove:` per region) and print the new image
    Update {
        /// Update instructions
        update: PathBuf,
        #[command(flatten)]
        input: InputArgs,
        /// Clear the mentioned regions instead of merging
        #[arg(long)]
        clear: bool,
        /// Keep map entries in insertion order
        #[arg(long)]
        no_canonical: bool,
        /// Encode definite-length containers
        #[arg(long)]
        no_indefinite: bool,
        /// Write the image here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Create an empty tag image
    Init {
        /// Usable tag memory in bytes
        #[arg(short, long)]
        size: usize,
        /// Aux region alignment; 1 disables alignment
        #[arg(short, long, default_value = "4")]
        block_size: usize,
        /// Bytes reserved for the aux region
        #[arg(short, long)]
        aux_region: Option<usize>,
        /// Fixed meta region size
        #[arg(short, long)]
        meta_region: Option<usize>,
        /// URI record placed before the payload
        #[arg(short = 'u', long)]
        ndef_uri: Option<String>,
        /// Record configuration YAML
        #[arg(long)]
        schema: Option<PathBuf>,
        /// Write the image here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Semantic checks of the main region
    Check {
        #[command(flatten)]
        input: InputArgs,
        /// Tag UID (hex, NFC-V UIDs start with E0)
        #[arg(long)]
        uid: Option<String>,
    },
}

pub fn run(action: RecordAction) -> Result<()> {
    match action {
        RecordAction::Info { input, options } => {
            let record = input.load()?;
            let (report, ok) = info_report(&record, &options.expand())?;
            print_yaml(&report)?;
            if !ok {
                bail!("record has errors");
            }
            Ok(())
        }
        RecordAction::Update {
            update,
            input,
            clear,
            no_canonical,
            no_indefinite,
            output,
        } => {
            let mut record = input.load()?;
            record.set_encode_config(EncodeConfig {
                canonical: !no_canonical,
                indefinite_containers: !no_indefinite,
            });
            let text = std::fs::read_to_string(&update)
                .with_context(|| format!("Failed to read {}", update.display()))?;
            let instructions: UpdateFile = serde_yaml::from_str(&text)
                .with_context(|| format!("Invalid update file {}", update.display()))?;
            apply_update(&mut record, instructions, clear)?;
            write_image(record.data(), output.as_deref())
        }
        RecordAction::Init {
            size,
            block_size,
            aux_region,
            meta_region,
            ndef_uri,
            schema,
            output,
        } => {
            let config = record_config(schema.as_deref())?;
            let options = InitOptions {
                size,
                block_size,
                aux_region,
                meta_region,
                ndef_uri,
            };
            let image = initialize_record(&config, &options)?;
            write_image(&image, output.as_deref())
        }
        RecordAction::Check { input, uid } => {
            let record = input.load()?;
            let uid = uid.as_deref().map(parse_hex).transpose()?;
            let report = semantic_check(&record, uid.as_deref())?;
            print_yaml(&report)?;
            if !report.is_ok() {
                bail!("record check failed");
            }
            Ok(())
        }
    }
}

fn write_image(image: &[u8], output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, image).with_context(|| format!("Failed to write {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(image)?;
            stdout.flush()?;
            Ok(())
        }
    }
}

fn insert<T: serde::Serialize>(report: &mut Mapping, key: &str, value: &T) -> Result<()> {
    report.insert(Value::from(key), serde_yaml::to_value(value)?);
    Ok(())
}

/// The `info` report, and whether the record passed the requested checks.
pub fn info_report(record: &Record, options: &InfoOptions) -> Result<(Mapping, bool)> {
    let mut report = Mapping::new();
    let mut ok = true;
    let info = record.info();

    if options.regions {
        insert(&mut report, "regions", &info.regions)?;
    }
    if options.root {
        insert(&mut report, "root", &info.root)?;
    }

    if options.data {
        let mut data = BTreeMap::new();
        let mut unknown_fields = BTreeMap::new();
        for region in record.regions() {
            if region.kind() == RegionKind::Meta && !options.meta {
                continue;
            }
            let mut unknown = UnknownFields::default();
            data.insert(region.kind(), record.read_with_unknown(region.kind(), &mut unknown)?);
            if !unknown.is_empty() {
                let raw: BTreeMap<String, String> = unknown
                    .iter()
                    .map(|f| (hex::encode(&f.raw_key), hex::encode(&f.raw_value)))
                    .collect();
                unknown_fields.insert(region.kind(), raw);
            }
        }
        insert(&mut report, "data", &data)?;
        if !unknown_fields.is_empty() {
            insert(&mut report, "unknown_fields", &unknown_fields)?;
        }
    }

    if options.raw {
        let raw: BTreeMap<RegionKind, String> = record
            .regions()
            .iter()
            .filter(|r| options.meta || r.kind() != RegionKind::Meta)
            .map(|r| (r.kind(), hex::encode(r.bytes(record.payload()))))
            .collect();
        insert(&mut report, "raw_data", &raw)?;
    }

    if options.uri {
        insert(&mut report, "uri", &info.uri)?;
    }

    if options.validate || options.check {
        let validation = record.validate();
        ok &= validation.is_ok();
        insert(&mut report, "validate", &validation)?;
    }

    if let Some(path) = &options.required_fields {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let required: BTreeMap<RegionKind, Vec<String>> = serde_yaml::from_str(&text)?;
        check_required(record, &required)?;
    }

    if options.check {
        let uid = options.uid.as_deref().map(parse_hex).transpose()?;
        let check = semantic_check(record, uid.as_deref())?;
        ok &= check.is_ok();
        insert(&mut report, "opt_check", &check)?;
    }

    Ok((report, ok))
}

fn check_required(record: &Record, required: &BTreeMap<RegionKind, Vec<String>>) -> Result<()> {
    for (kind, fields) in required {
        if record.region(*kind).is_none() {
            bail!("Missing region {}", kind);
        }
        let values = record.read(*kind)?;
        if let Some(missing) = fields.iter().find(|f| !values.contains_key(*f)) {
            bail!("Missing field '{}' in region '{}'", missing, kind);
        }
    }
    Ok(())
}

/// Contents of an `update` instruction file.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateFile {
    #[serde(default)]
    pub data: BTreeMap<RegionKind, FieldMap>,
    #[serde(default)]
    pub remove: BTreeMap<RegionKind, Vec<String>>,
}

/// Apply `instructions` to every region they mention.
pub fn apply_update(record: &mut Record, mut instructions: UpdateFile, clear: bool) -> Result<()> {
    let kinds: BTreeSet<RegionKind> = instructions
        .data
        .keys()
        .chain(instructions.remove.keys())
        .copied()
        .collect();

    for kind in kinds {
        let update = RegionUpdate {
            fields: instructions.data.remove(&kind).unwrap_or_default(),
            remove: instructions.remove.remove(&kind).unwrap_or_default(),
            clear,
        };
        record
            .update(kind, &update)
            .with_context(|| format!("Failed to update region '{}'", kind))?;
    }
    Ok(())
}
