//! CLI commands
//!
//! `backend` runs the service; `client` talks to it; `record` and `decode`
//! work offline on card images read from a file or stdin.

pub mod backend;
pub mod client;
pub mod decode;
pub mod record;

use anyhow::{Context, Result};
use spooltag_record::RecordConfig;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// Card image from `file`, or stdin when absent. With `hex` the input is a
/// hex string (`0x` prefixes, whitespace and `:` are ignored).
pub fn read_image(file: Option<&Path>, hex: bool) -> Result<Vec<u8>> {
    let data = match file {
        Some(path) => std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut data = Vec::new();
            std::io::stdin()
                .read_to_end(&mut data)
                .context("Failed to read stdin")?;
            data
        }
    };
    if !hex {
        return Ok(data);
    }
    let text = String::from_utf8(data).context("Hex input is not text")?;
    parse_hex(&text)
}

pub fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let cleaned: String = text
        .replace("0x", "")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&cleaned).with_context(|| format!("Invalid hex: {}", text.trim()))
}

/// Record schema from a YAML file, else the built-in one.
pub fn record_config(path: Option<&Path>) -> Result<Arc<RecordConfig>> {
    let config = match path {
        Some(path) => RecordConfig::from_file(path)
            .with_context(|| format!("Failed to load record config {}", path.display()))?,
        None => RecordConfig::builtin().context("Failed to load built-in record config")?,
    };
    Ok(Arc::new(config))
}

/// Print `value` as YAML on stdout.
pub fn print_yaml<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_yaml::to_string(value).context("Failed to format output")?;
    print!("{}", text);
    Ok(())
}
