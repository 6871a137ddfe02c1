//! Logging setup shared by the pipeline binary.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, Result};

/// Default location of the running log, relative to the working directory.
pub const DEFAULT_LOG_FILE: &str = "logs/running_logs.log";

/// Installs a console logger and, when `log_file` is set, a plain-text copy
/// appended to that file.
pub fn setup_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logger: {e}")))?;

    Ok(())
}
