//! Printer collaborator: tells Klipper which spool is loaded through
//! Moonraker's G-code endpoint.

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use serde_json::json;
use spooltag_protocol::defaults::HTTP_TIMEOUT_SECS;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

pub trait Printer: Send + Sync {
    /// Make `spool` / `filament` the active ones. `(0, 0)` clears.
    fn set_spool_and_filament(&self, spool: u64, filament: u64) -> Result<()>;
}

/// G-code sent for a spool change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcodeTemplates {
    pub setting: Vec<String>,
    /// Sent verbatim when clearing; empty uses `setting` with zero ids
    pub clearing: Vec<String>,
}

impl GcodeTemplates {
    pub fn new(setting: Vec<String>, clearing: Vec<String>) -> Self {
        Self { setting, clearing }
    }

    pub fn commands(&self, spool: u64, filament: u64) -> Vec<String> {
        if spool == 0 && filament == 0 && !self.clearing.is_empty() {
            return self.clearing.clone();
        }
        self.setting
            .iter()
            .map(|template| {
                template
                    .replace("{spool}", &spool.to_string())
                    .replace("{filament}", &filament.to_string())
            })
            .collect()
    }
}

impl Default for GcodeTemplates {
    fn default() -> Self {
        Self {
            setting: vec![
                "SET_ACTIVE_SPOOL ID={spool}".to_string(),
                "SET_ACTIVE_FILAMENT ID={filament}".to_string(),
            ],
            clearing: Vec::new(),
        }
    }
}

pub struct MoonrakerClient {
    base_url: String,
    templates: GcodeTemplates,
    http_client: Client,
}

impl MoonrakerClient {
    pub fn new(url: &str, templates: GcodeTemplates) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: url.trim_end_matches('/').to_string(),
            templates,
            http_client,
        })
    }
}

impl Printer for MoonrakerClient {
    fn set_spool_and_filament(&self, spool: u64, filament: u64) -> Result<()> {
        let commands = self.templates.commands(spool, filament);
        let response = self
            .http_client
            .post(format!("{}/api/printer/command", self.base_url))
            .json(&json!({ "commands": commands }))
            .send()
            .context("Request to moonraker failed")?;

        if response.status() != reqwest::StatusCode::OK {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            bail!("Request to moonraker failed: {} {}", status, body);
        }
        info!(spool, filament, "sent spool to moonraker");
        Ok(())
    }
}

/// Printer stand-in for mock mode and tests. Logs and remembers what it
/// would have sent.
#[derive(Debug, Default)]
pub struct MockPrinter {
    templates: GcodeTemplates,
    sent: Mutex<Vec<(u64, u64)>>,
    fail: Mutex<bool>,
}

impl MockPrinter {
    pub fn new(templates: GcodeTemplates) -> Self {
        Self {
            templates,
            ..Default::default()
        }
    }

    /// Pairs sent so far.
    pub fn sent(&self) -> Vec<(u64, u64)> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Make subsequent calls fail.
    pub fn set_failing(&self, fail: bool) {
        if let Ok(mut flag) = self.fail.lock() {
            *flag = fail;
        }
    }
}

impl Printer for MockPrinter {
    fn set_spool_and_filament(&self, spool: u64, filament: u64) -> Result<()> {
        if self.fail.lock().map(|f| *f).unwrap_or(false) {
            warn!(spool, filament, "mock printer refusing request");
            bail!("Request to moonraker failed: mock printer offline");
        }
        info!(
            commands = ?self.templates.commands(spool, filament),
            "mock printer would execute"
        );
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((spool, filament));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_commands() {
        let templates = GcodeTemplates::default();
        assert_eq!(
            templates.commands(5, 12),
            vec!["SET_ACTIVE_SPOOL ID=5", "SET_ACTIVE_FILAMENT ID=12"]
        );
        assert_eq!(
            templates.commands(0, 0),
            vec!["SET_ACTIVE_SPOOL ID=0", "SET_ACTIVE_FILAMENT ID=0"]
        );
    }

    #[test]
    fn test_clearing_commands_are_verbatim() {
        let templates = GcodeTemplates::new(
            vec!["SET_ACTIVE_SPOOL ID={spool}".to_string()],
            vec!["CLEAR_ACTIVE_SPOOL".to_string()],
        );
        assert_eq!(templates.commands(0, 0), vec!["CLEAR_ACTIVE_SPOOL"]);
        assert_eq!(templates.commands(0, 3), vec!["SET_ACTIVE_SPOOL ID=0"]);
    }

    #[test]
    fn test_mock_printer_records_and_fails() {
        let printer = MockPrinter::default();
        printer.set_spool_and_filament(1, 10).unwrap();
        printer.set_failing(true);
        assert!(printer.set_spool_and_filament(2, 11).is_err());
        assert_eq!(printer.sent(), vec![(1, 10)]);
    }

    #[test]
    fn test_unreachable_moonraker_is_an_error() {
        let client = MoonrakerClient::new("http://127.0.0.1:1/", GcodeTemplates::default()).unwrap();
        assert!(client.set_spool_and_filament(1, 2).is_err());
    }
}
