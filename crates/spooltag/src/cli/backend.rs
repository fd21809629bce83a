//! `spooltag backend`

use anyhow::{Context, Result};
use spooltag::config::{self, use_mocks_from_env};
use spooltag::{run_backend, Collaborators};
use spooltag_reader::CancellationToken;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug)]
pub struct BackendArgs {
    pub config: Option<PathBuf>,
    pub mock: bool,
}

pub fn run(args: BackendArgs) -> Result<()> {
    let candidates = config::search_paths()?;
    let config = config::load_or_install(args.config.as_deref(), &candidates)?;
    let use_mocks = args.mock || use_mocks_from_env();
    let collaborators = Collaborators::from_config(&config, use_mocks)?;

    let cancel = CancellationToken::new();
    install_signal_handler(cancel.clone())?;

    info!(
        device = %collaborators.device,
        socket = %config.socket_path().display(),
        "starting backend"
    );
    run_backend(&config, collaborators, cancel)
}

/// SIGINT/SIGTERM cancel `cancel`; the backend then stops the reader and
/// removes its socket.
fn install_signal_handler(cancel: CancellationToken) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;
    std::thread::Builder::new()
        .name("spooltag-signals".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!("Received signal {}, initiating shutdown...", sig);
                cancel.cancel();
            }
        })?;
    Ok(())
}
