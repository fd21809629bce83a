//! spooltag launcher
//!
//! - `backend`: NFC reader loop plus the Unix socket server
//! - `client`: requests to a running backend
//! - `record`, `decode`: offline card image tools

use anyhow::Result;
use clap::{Parser, Subcommand};
use spooltag_logging::{init_logging, LogConfig};
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

#[derive(Parser, Debug)]
#[command(name = "spooltag", version, about = "NFC filament spool tags for Klipper and Spoolman")]
struct Cli {
    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Only log warnings and errors to the console
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Configuration file (default: ~/spooltag.toml, then ~/.config/spooltag/spooltag.toml)
    #[arg(short = 'c', long, global = true, env = "SPOOLTAG_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the NFC reader and the socket server
    Backend {
        /// Use the demo reader, a sample inventory and a logging printer
        #[arg(long)]
        mock: bool,
    },

    /// Send a request to a running backend
    Client {
        /// Print the raw JSON response
        #[arg(long, global = true)]
        json: bool,

        #[command(subcommand)]
        action: cli::client::ClientAction,
    },

    /// Inspect, update and create OpenPrintTag card images
    Record {
        #[command(subcommand)]
        action: cli::record::RecordAction,
    },

    /// Run the tag decoders over a card image
    Decode(cli::decode::DecodeArgs),
}

fn run_command(cli: Cli) -> Result<()> {
    let config = cli.config.as_deref();
    match cli.command {
        Commands::Backend { mock } => cli::backend::run(cli::backend::BackendArgs {
            config: cli.config.clone(),
            mock,
        }),
        Commands::Client { json, action } => cli::client::run(action, config, json),
        Commands::Record { action } => cli::record::run(action),
        Commands::Decode(args) => cli::decode::run(args, config),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Offline tools write their results to stdout; keep the console quiet
    let is_service = matches!(cli.command, Commands::Backend { .. });
    if let Err(err) = init_logging(LogConfig {
        app_name: "spooltag",
        verbose: cli.verbose,
        quiet: cli.quiet || !is_service,
    }) {
        eprintln!("Warning: failed to initialize logging: {:#}", err);
    }

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_client_write_tag() {
        let cli = Cli::try_parse_from(["spooltag", "client", "write-tag", "5", "12"]).unwrap();
        match cli.command {
            Commands::Client { action, json } => {
                assert!(!json);
                assert_eq!(
                    action.request(),
                    spooltag_protocol::Request::WriteTag { spool: 5, filament: 12 }
                );
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_backend_with_global_flags() {
        let cli = Cli::try_parse_from(["spooltag", "backend", "--mock", "-v", "-c", "/tmp/s.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/s.toml")));
        assert!(matches!(cli.command, Commands::Backend { mock: true }));
    }

    #[test]
    fn test_parse_record_info_all() {
        let cli = Cli::try_parse_from(["spooltag", "record", "info", "--all", "--unhex", "card.hex"]).unwrap();
        let Commands::Record { action: cli::record::RecordAction::Info { input, options } } = cli.command else {
            panic!("expected record info");
        };
        assert!(options.all);
        assert!(input.unhex);
        assert_eq!(input.file, Some(PathBuf::from("card.hex")));
    }
}
