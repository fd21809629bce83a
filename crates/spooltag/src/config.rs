//! Configuration loading
//!
//! The first of `~/spooltag.toml` and `~/.config/spooltag/spooltag.toml`
//! that exists is used, unless a path is given explicitly. When neither
//! exists the default configuration is installed into the config directory
//! and loading fails, so the user reviews it before the first run.

use crate::moonraker::GcodeTemplates;
use serde::Deserialize;
use spooltag_parsers::ImportSettings;
use spooltag_protocol::defaults::{
    DEFAULT_MOONRAKER_URL, DEFAULT_NFC_DEVICE, DEFAULT_POLL_INTERVAL_MS, DEFAULT_SOCKET_PATH,
    DEFAULT_SPOOLMAN_URL, DEFAULT_WRITE_TIMEOUT_SECS,
};
use spooltag_reader::LoopConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const CONFIG_FILE_NAME: &str = "spooltag.toml";

/// Set to `1`, `true` or `yes` to run against mock reader and services.
pub const USE_MOCKS_ENV: &str = "SPOOLTAG_USE_MOCKS";

const DEFAULT_CONFIG: &str = include_str!("../spooltag.default.toml");

/// Error type for config operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Config not found at: {0}")]
    NotFound(String),

    #[error("Installed a default config at {}, review it and start again", .0.display())]
    Installed(PathBuf),
}

/// Result type for config operations
pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub spoolman: SpoolmanConfig,

    #[serde(default)]
    pub moonraker: MoonrakerConfig,

    #[serde(default)]
    pub nfc: NfcConfig,

    #[serde(default)]
    pub webserver: WebserverConfig,

    #[serde(default)]
    pub parsers: ParsersConfig,

    #[serde(default)]
    pub openprinttag: ImportSettings,

    #[serde(default)]
    pub opentag3d: ImportSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpoolmanConfig {
    #[serde(default = "default_spoolman_url", alias = "spoolman-url")]
    pub url: String,
}

impl Default for SpoolmanConfig {
    fn default() -> Self {
        Self {
            url: default_spoolman_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MoonrakerConfig {
    #[serde(default = "default_moonraker_url", alias = "moonraker-url")]
    pub url: String,

    /// Re-send a pair even when it was the last one sent
    #[serde(default, alias = "always-send")]
    pub always_send: bool,

    /// Clear the active spool on empty tags and at startup
    #[serde(default, alias = "clear-spool")]
    pub clear_spool: bool,

    /// Commands sent for a spool, `{spool}` and `{filament}` substituted
    #[serde(default = "default_setting_gcode")]
    pub setting_gcode: Vec<String>,

    /// Commands sent when clearing. Empty: `setting_gcode` with zero ids
    #[serde(default)]
    pub clearing_gcode: Vec<String>,
}

impl MoonrakerConfig {
    pub fn templates(&self) -> GcodeTemplates {
        GcodeTemplates::new(self.setting_gcode.clone(), self.clearing_gcode.clone())
    }
}

impl Default for MoonrakerConfig {
    fn default() -> Self {
        Self {
            url: default_moonraker_url(),
            always_send: false,
            clear_spool: false,
            setting_gcode: default_setting_gcode(),
            clearing_gcode: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NfcConfig {
    /// `mock` or `file:<path>`
    #[serde(default = "default_nfc_device", alias = "nfc-device")]
    pub device: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl Default for NfcConfig {
    fn default() -> Self {
        Self {
            device: default_nfc_device(),
            poll_interval_ms: default_poll_interval_ms(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebserverConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

impl Default for WebserverConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParsersConfig {
    #[serde(default = "default_parser_order")]
    pub order: Vec<String>,
}

impl Default for ParsersConfig {
    fn default() -> Self {
        Self {
            order: default_parser_order(),
        }
    }
}

fn default_spoolman_url() -> String { DEFAULT_SPOOLMAN_URL.to_string() }
fn default_moonraker_url() -> String { DEFAULT_MOONRAKER_URL.to_string() }
fn default_setting_gcode() -> Vec<String> { GcodeTemplates::default().setting }
fn default_nfc_device() -> String { DEFAULT_NFC_DEVICE.to_string() }
fn default_poll_interval_ms() -> u64 { DEFAULT_POLL_INTERVAL_MS }
fn default_write_timeout_secs() -> u64 { DEFAULT_WRITE_TIMEOUT_SECS }
fn default_socket_path() -> String { DEFAULT_SOCKET_PATH.to_string() }
fn default_parser_order() -> Vec<String> {
    ["tag_id", "ndef_text", "opentag3d", "openprinttag"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(text)?;
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        for url in [&mut self.spoolman.url, &mut self.moonraker.url] {
            while url.ends_with('/') {
                url.pop();
            }
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        expand_home(&self.webserver.socket_path)
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            poll_interval: Duration::from_millis(self.nfc.poll_interval_ms),
            write_timeout: Duration::from_secs(self.nfc.write_timeout_secs),
            ..LoopConfig::default()
        }
    }
}

/// Replace a leading `~` with the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(path),
    };
    match dirs::home_dir() {
        Some(home) if rest.is_empty() => home,
        Some(home) => home.join(rest),
        None => PathBuf::from(path),
    }
}

/// Load a configuration file
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path)?;
    Config::from_toml(&content)
}

/// Candidate config files, most specific first.
pub fn search_paths() -> Result<Vec<PathBuf>> {
    let home = dirs::home_dir()
        .ok_or_else(|| ConfigError::NotFound("Could not find home directory".to_string()))?;
    let config_dir = dirs::config_dir().unwrap_or_else(|| home.join(".config"));
    Ok(vec![
        home.join(CONFIG_FILE_NAME),
        config_dir.join("spooltag").join(CONFIG_FILE_NAME),
    ])
}

/// Load `explicit`, else the first existing file of `candidates`.
///
/// With nothing found the default config is written to the last candidate
/// and [`ConfigError::Installed`] returned.
pub fn load_or_install(explicit: Option<&Path>, candidates: &[PathBuf]) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    if let Some(path) = candidates.iter().find(|p| p.exists()) {
        info!(path = %path.display(), "loading config");
        return load_config(path);
    }

    let target = candidates
        .last()
        .ok_or_else(|| ConfigError::NotFound("no config locations".to_string()))?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(target, DEFAULT_CONFIG)?;
    Err(ConfigError::Installed(target.clone()))
}

/// Like [`load_or_install`] but falls back to the defaults instead of
/// installing a file. For commands that only need the socket path.
pub fn load_existing(explicit: Option<&Path>, candidates: &[PathBuf]) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    match candidates.iter().find(|p| p.exists()) {
        Some(path) => load_config(path),
        None => Ok(Config::default()),
    }
}

/// Whether `value` of [`USE_MOCKS_ENV`] asks for mocks.
pub fn mocks_requested(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes")
    )
}

pub fn use_mocks_from_env() -> bool {
    mocks_requested(std::env::var(USE_MOCKS_ENV).ok().as_deref())
}
