//! Logging setup shared by spooltag binaries.
//!
//! Events go to `<home>/logs/<app>.log` and to stderr. `RUST_LOG` overrides
//! the default filter.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "spooltag=info,spooltag_reader=info,spooltag_parsers=info,spooltag_record=info";

/// A log file larger than this at startup is started over.
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "SPOOLTAG_HOME";

pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Console gets the full filter
    pub verbose: bool,
    /// Console only shows warnings and errors
    pub quiet: bool,
}

pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let logs = spooltag_home()?.join("logs");
    let file = open_log_file(&logs, config.app_name)
        .with_context(|| format!("Failed to open log file in {}", logs.display()))?;

    let file_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.quiet && !config.verbose {
        EnvFilter::new("warn")
    } else {
        file_filter.clone()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(config.verbose)
                .with_filter(console_filter),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(())
}

/// `$SPOOLTAG_HOME`, else `~/.spooltag`.
pub fn spooltag_home() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(HOME_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    dirs::home_dir()
        .map(|home| home.join(".spooltag"))
        .ok_or_else(|| anyhow!("Could not determine home directory"))
}

/// `<dir>/<app>.log`, opened for appending.
fn open_log_file(dir: &Path, app_name: &str) -> io::Result<File> {
    fs::create_dir_all(dir)?;
    let name: String = app_name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    let path = dir.join(format!("{}.log", name));

    let oversized = fs::metadata(&path).is_ok_and(|m| m.len() > MAX_LOG_FILE_SIZE);
    OpenOptions::new()
        .create(true)
        .write(true)
        .append(!oversized)
        .truncate(oversized)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_log_file_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir_all(&logs).unwrap();
        fs::write(logs.join("spooltag.log"), b"old\n").unwrap();

        let mut file = open_log_file(&logs, "spooltag").unwrap();
        file.write_all(b"new\n").unwrap();
        assert_eq!(fs::read_to_string(logs.join("spooltag.log")).unwrap(), "old\nnew\n");
    }

    #[test]
    fn test_oversized_log_file_starts_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spooltag.log");
        fs::write(&path, vec![b'x'; MAX_LOG_FILE_SIZE as usize + 1]).unwrap();

        let mut file = open_log_file(dir.path(), "spooltag").unwrap();
        file.write_all(b"fresh\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh\n");
    }

    #[test]
    fn test_app_name_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        open_log_file(&dir.path().join("new"), "spool tag/x").unwrap();
        assert!(dir.path().join("new").join("spool_tag_x.log").exists());
    }
}
