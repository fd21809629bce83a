//! `spooltag decode`: run the decoder chain over a card image offline.

use super::{parse_hex, print_yaml, read_image, record_config};
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use spooltag::backend::build_chain;
use spooltag::config::{self, Config};
use spooltag_parsers::{Inventory, MemoryInventory};
use spooltag_protocol::ReadEvent;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(clap::Args, Debug, Clone)]
pub struct DecodeArgs {
    /// Card image; stdin when omitted
    pub file: Option<PathBuf>,

    /// Input is a hex string instead of raw bytes
    #[arg(long)]
    pub unhex: bool,

    /// Card UID as hex
    #[arg(long)]
    pub uid: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DecodeReport {
    pub identifier: String,
    pub parsers: Vec<&'static str>,
    pub spool: Option<String>,
    pub filament: Option<String>,
    /// The matching spool in the sample inventory
    pub spool_record: Option<Value>,
}

pub fn run(args: DecodeArgs, config_path: Option<&std::path::Path>) -> Result<()> {
    let candidates = config::search_paths()?;
    let config = config::load_existing(config_path, &candidates)?;
    let image = read_image(args.file.as_deref(), args.unhex)?;
    let uid = args.uid.as_deref().map(parse_hex).transpose()?.unwrap_or_default();
    print_yaml(&decode(&config, image, &uid)?)
}

/// Decode against the sample inventory; self-describing tags create
/// entries there.
pub fn decode(config: &Config, image: Vec<u8>, uid: &[u8]) -> Result<DecodeReport> {
    let inventory = Arc::new(MemoryInventory::with_sample_data());
    let chain = build_chain(config, inventory.clone(), record_config(None)?)?;

    let event = ReadEvent::new(Some(image), uid);
    let ids = chain.parse(&event);
    let spool_record = ids
        .spool
        .as_deref()
        .and_then(|s| s.parse::<u64>().ok())
        .and_then(|id| inventory.spool(id).ok());

    Ok(DecodeReport {
        identifier: event.identifier.clone(),
        parsers: chain.names(),
        spool: ids.spool,
        filament: ids.filament,
        spool_record,
    })
}
