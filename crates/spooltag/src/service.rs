//! The running backend: reader loop, IPC server and collaborators wired
//! together.

use crate::backend::{build_chain, Backend, BackendSettings, Handlers};
use crate::config::Config;
use crate::ipc::IpcServer;
use crate::moonraker::{MockPrinter, MoonrakerClient, Printer};
use crate::spoolman::SpoolmanClient;
use anyhow::{anyhow, Context, Result};
use spooltag_parsers::{Inventory, MemoryInventory};
use spooltag_reader::{open_device, CancellationToken, ReaderLoop};
use spooltag_record::RecordConfig;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

const SUPERVISE_INTERVAL: Duration = Duration::from_millis(100);

/// Outside services the backend talks to.
pub struct Collaborators {
    pub inventory: Arc<dyn Inventory>,
    pub printer: Arc<dyn Printer>,
    /// Reader device string, see [`open_device`]
    pub device: String,
}

impl Collaborators {
    pub fn from_config(config: &Config, use_mocks: bool) -> Result<Self> {
        if use_mocks {
            info!("using mock objects");
            return Ok(Self::mocks(config));
        }
        let inventory = SpoolmanClient::new(&config.spoolman.url)
            .context("Failed to create Spoolman client")?;
        let printer = MoonrakerClient::new(&config.moonraker.url, config.moonraker.templates())?;
        Ok(Self {
            inventory: Arc::new(inventory),
            printer: Arc::new(printer),
            device: config.nfc.device.clone(),
        })
    }

    /// Sample inventory, logging printer and the demo reader.
    pub fn mocks(config: &Config) -> Self {
        Self {
            inventory: Arc::new(MemoryInventory::with_sample_data()),
            printer: Arc::new(MockPrinter::new(config.moonraker.templates())),
            device: "mock".to_string(),
        }
    }
}

/// Run until `cancel` fires or the reader loop dies.
pub fn run_backend(config: &Config, collaborators: Collaborators, cancel: CancellationToken) -> Result<()> {
    let record_config = Arc::new(RecordConfig::builtin().context("Failed to load record schema")?);
    let chain = build_chain(config, collaborators.inventory.clone(), record_config)?;
    let backend = Arc::new(Backend::new(
        chain,
        collaborators.inventory,
        collaborators.printer,
        BackendSettings::from_config(config),
    ));
    backend.startup();

    let server = IpcServer::bind(&config.socket_path())?;

    let device = collaborators.device;
    let reader = ReaderLoop::start(
        move || open_device(&device),
        backend.clone(),
        config.loop_config(),
        cancel.clone(),
    )
    .context("Failed to start NFC reader")?;

    let handlers = Handlers::new(backend, Arc::new(reader.writer()));
    let server_thread = {
        let cancel = cancel.clone();
        thread::Builder::new()
            .name("spooltag-ipc".to_string())
            .spawn(move || server.run(&handlers, &cancel))?
    };

    while !cancel.is_cancelled() {
        if reader.is_finished() {
            error!("reader loop terminated unexpectedly");
            break;
        }
        if server_thread.is_finished() {
            error!("socket server terminated unexpectedly");
            break;
        }
        thread::sleep(SUPERVISE_INTERVAL);
    }

    info!("shutting down");
    cancel.cancel();
    let reader_result = reader.join();
    let server_result = server_thread
        .join()
        .map_err(|_| anyhow!("socket server thread panicked"))?;

    reader_result.context("NFC reader failed")?;
    server_result
}
