//! spooltag backend library.
//!
//! Reads filament spool tags, tells the printer which spool is loaded and
//! answers requests from local clients over a Unix socket.
//!
//! | Module | |
//! |---|---|
//! | [`config`] | TOML configuration |
//! | [`backend`] | Tag events, backend state, request handlers |
//! | [`ipc`] | Unix socket server and client |
//! | [`spoolman`] | Inventory service client |
//! | [`moonraker`] | Printer client |
//! | [`service`] | Wiring for the running backend |

pub mod backend;
pub mod config;
pub mod ipc;
pub mod moonraker;
pub mod service;
pub mod spoolman;

pub use backend::{Backend, BackendSettings, BackendState, Handlers};
pub use config::{Config, ConfigError};
pub use ipc::{IpcClient, IpcServer};
pub use service::{run_backend, Collaborators};
