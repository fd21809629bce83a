//! Backend state, tag event handling and the request handlers.
//!
//! The poll loop thread delivers tag events; the IPC server thread calls
//! [`Handlers::handle`]. Both meet in [`Backend`], whose state sits behind
//! one mutex that is never held across a network call.

use crate::config::Config;
use crate::moonraker::Printer;
use anyhow::{bail, Result};
use serde_json::Value;
use spooltag_parsers::{
    Inventory, NdefTextParser, OpenPrintTagParser, OpenTag3dParser, ParserChain, TagIdParser,
};
use spooltag_protocol::{ReadEvent, Request, Response, StateSnapshot};
use spooltag_reader::{TagEvents, TagWriter};
use spooltag_record::RecordConfig;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Commands understood by [`Handlers`].
pub const COMMANDS: &[&str] = &["write_tag", "set_nfc_id", "get_spools", "get_state"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendSettings {
    pub always_send: bool,
    pub clear_spool: bool,
}

impl BackendSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            always_send: config.moonraker.always_send,
            clear_spool: config.moonraker.clear_spool,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendState {
    /// Identifier of the last card read
    pub last_nfc_id: Option<String>,
    /// Spool id of the last card that named one
    pub last_spool_id: Option<String>,
    /// Pair the printer last accepted
    pub last_sent: Option<(u64, u64)>,
}

/// Build the decoder chain from configured names.
pub fn build_chain(config: &Config, inventory: Arc<dyn Inventory>, record_config: Arc<RecordConfig>) -> Result<ParserChain> {
    let mut chain = ParserChain::new();
    for name in &config.parsers.order {
        match name.as_str() {
            "tag_id" => chain.push(Box::new(TagIdParser::new(inventory.clone()))),
            "ndef_text" => chain.push(Box::new(NdefTextParser::new())),
            "opentag3d" => chain.push(Box::new(OpenTag3dParser::new(
                inventory.clone(),
                config.opentag3d.clone(),
            ))),
            "openprinttag" => chain.push(Box::new(OpenPrintTagParser::new(
                inventory.clone(),
                config.openprinttag.clone(),
                record_config.clone(),
            ))),
            other => bail!("Unknown parser '{}' in [parsers] order", other),
        }
    }
    Ok(chain)
}

pub struct Backend {
    chain: ParserChain,
    inventory: Arc<dyn Inventory>,
    printer: Arc<dyn Printer>,
    settings: BackendSettings,
    state: Mutex<BackendState>,
}

impl Backend {
    pub fn new(
        chain: ParserChain,
        inventory: Arc<dyn Inventory>,
        printer: Arc<dyn Printer>,
        settings: BackendSettings,
    ) -> Self {
        info!(parsers = ?chain.names(), ?settings, "backend created");
        Self {
            chain,
            inventory,
            printer,
            settings,
            state: Mutex::new(BackendState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        // The state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BackendState {
        self.lock().clone()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let state = self.lock();
        StateSnapshot {
            nfc_id: state.last_nfc_id.clone(),
            spool_id: state.last_spool_id.clone(),
        }
    }

    pub fn inventory(&self) -> &Arc<dyn Inventory> {
        &self.inventory
    }

    /// Clear the active spool when configured to.
    pub fn startup(&self) {
        if self.settings.clear_spool {
            self.set_spool_and_filament(0, 0);
        }
    }

    /// Send a pair to the printer unless it was the last one sent.
    pub fn set_spool_and_filament(&self, spool: u64, filament: u64) {
        {
            let mut state = self.lock();
            if !self.settings.always_send && state.last_sent == Some((spool, filament)) {
                info!(spool, filament, "read same spool & filament");
                return;
            }
            state.last_sent = None;
        }

        info!(spool, filament, "sending spool to printer");
        match self.printer.set_spool_and_filament(spool, filament) {
            Ok(()) => self.lock().last_sent = Some((spool, filament)),
            Err(e) => error!("{:#}", e),
        }
    }
}

impl TagEvents for Backend {
    fn tag_present(&self, event: &ReadEvent) {
        let ids = self.chain.parse(event);
        {
            let mut state = self.lock();
            state.last_nfc_id = Some(event.identifier.clone());
            if let Some(spool) = &ids.spool {
                state.last_spool_id = Some(spool.clone());
            }
        }

        let Some((spool, filament)) = ids.pair() else {
            info!(
                identifier = %event.identifier,
                "did not find spool records in tag nor from its id"
            );
            return;
        };

        match (spool.trim().parse::<u64>(), filament.trim().parse::<u64>()) {
            (Ok(spool), Ok(filament)) => self.set_spool_and_filament(spool, filament),
            _ => warn!(%spool, %filament, "tag ids are not numbers"),
        }
    }

    fn no_tag(&self) {
        debug!("no tag data present");
        if self.settings.clear_spool {
            self.set_spool_and_filament(0, 0);
        }
    }
}

/// Tag writing as seen by the request handlers.
pub trait WriteTag: Send + Sync {
    fn write_to_tag(&self, spool: u64, filament: u64) -> bool;
}

impl WriteTag for TagWriter {
    fn write_to_tag(&self, spool: u64, filament: u64) -> bool {
        TagWriter::write_to_tag(self, spool, filament)
    }
}

/// Request dispatch for the IPC server.
#[derive(Clone)]
pub struct Handlers {
    backend: Arc<Backend>,
    writer: Arc<dyn WriteTag>,
}

impl Handlers {
    pub fn new(backend: Arc<Backend>, writer: Arc<dyn WriteTag>) -> Self {
        Self { backend, writer }
    }

    /// Answer one raw request. Never fails: problems become error responses.
    pub fn handle(&self, data: &[u8]) -> Response {
        let value: Value = match serde_json::from_slice(data) {
            Ok(value) => value,
            Err(e) => {
                warn!("malformed request: {}", e);
                return Response::error(e.to_string());
            }
        };

        let command = value.get("command").cloned().unwrap_or(Value::Null);
        let known = command.as_str().map_or(false, |c| COMMANDS.contains(&c));
        if !known {
            let name = match &command {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Response::error(format!("Unknown command: {}", name));
        }

        match serde_json::from_value::<Request>(value) {
            Ok(request) => self.dispatch(request),
            Err(e) => {
                warn!("invalid request: {}", e);
                Response::error(e.to_string())
            }
        }
    }

    pub fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::WriteTag { spool, filament } => self.write_tag(spool, filament),
            Request::SetNfcId { spool } => self.set_nfc_id(spool),
            Request::GetSpools => self.get_spools(),
            Request::GetState => Response::state(self.backend.snapshot()),
        }
    }

    fn write_tag(&self, spool: u64, filament: u64) -> Response {
        info!(spool, filament, "write tag requested");
        if self.writer.write_to_tag(spool, filament) {
            Response::ok()
        } else {
            Response::error("Failed to write to tag")
        }
    }

    fn set_nfc_id(&self, spool: u64) -> Response {
        let Some(identifier) = self.backend.snapshot().nfc_id else {
            return Response::error("No nfc_id to write");
        };
        info!(nfc_id = %identifier, spool, "setting nfc_id in inventory");

        match self.backend.inventory().set_nfc_id(spool, &identifier) {
            Ok(true) => Response::ok(),
            Ok(false) => Response::error("Failed to send nfc_id to Spoolman"),
            Err(e) => {
                warn!("setting nfc_id failed: {}", e);
                Response::error("Failed to send nfc_id to Spoolman")
            }
        }
    }

    fn get_spools(&self) -> Response {
        match self.backend.inventory().spools() {
            Ok(spools) => Response::spools(spools),
            Err(e) => {
                warn!("fetching spools failed: {}", e);
                Response::error(e.to_string())
            }
        }
    }
}
