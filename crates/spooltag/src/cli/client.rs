//! `spooltag client ...`: requests to a running backend.

use anyhow::{bail, Result};
use clap::Subcommand;
use serde_json::Value;
use spooltag::config;
use spooltag::IpcClient;
use spooltag_protocol::{Request, Response};
use std::path::Path;

#[derive(Subcommand, Debug, Clone)]
pub enum ClientAction {
    /// Write spool and filament ids to the next tag on the reader
    WriteTag {
        spool: u64,
        filament: u64,
    },
    /// Store the last read tag's id on a spool in Spoolman
    SetNfcId {
        spool: u64,
    },
    /// List spools known to Spoolman
    GetSpools,
    /// Show the last read tag
    GetState,
}

impl ClientAction {
    pub fn request(&self) -> Request {
        match *self {
            ClientAction::WriteTag { spool, filament } => Request::WriteTag { spool, filament },
            ClientAction::SetNfcId { spool } => Request::SetNfcId { spool },
            ClientAction::GetSpools => Request::GetSpools,
            ClientAction::GetState => Request::GetState,
        }
    }
}

pub fn run(action: ClientAction, config_path: Option<&Path>, json: bool) -> Result<()> {
    let candidates = config::search_paths()?;
    let config = config::load_existing(config_path, &candidates)?;
    let client = IpcClient::new(config.socket_path());

    let request = action.request();
    let response = client.send(&request);
    if !response.is_ok() {
        bail!(
            "{}",
            response.message.as_deref().unwrap_or("Request failed")
        );
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }
    for line in render(&request, &response) {
        println!("{}", line);
    }
    Ok(())
}

fn render(request: &Request, response: &Response) -> Vec<String> {
    match request {
        Request::GetSpools => response
            .spools
            .iter()
            .flatten()
            .map(spool_line)
            .collect(),
        Request::GetState => {
            let nfc_id = response.nfc_id.clone().flatten();
            let spool_id = response.spool_id.clone().flatten();
            vec![
                format!("nfc_id:   {}", nfc_id.as_deref().unwrap_or("-")),
                format!("spool_id: {}", spool_id.as_deref().unwrap_or("-")),
            ]
        }
        _ => vec!["ok".to_string()],
    }
}

/// `#<id> <vendor> - <filament>`
fn spool_line(spool: &Value) -> String {
    let text = |v: &Value| v.as_str().unwrap_or("?").to_string();
    let id = spool.get("id").map(|v| v.to_string()).unwrap_or_else(|| "?".to_string());
    let filament = spool.get("filament");
    let vendor = filament
        .and_then(|f| f.get("vendor"))
        .and_then(|v| v.get("name"))
        .map(text)
        .unwrap_or_else(|| "?".to_string());
    let name = filament
        .and_then(|f| f.get("name"))
        .map(text)
        .unwrap_or_else(|| "?".to_string());
    format!("#{} {} - {}", id, vendor, name)
}
