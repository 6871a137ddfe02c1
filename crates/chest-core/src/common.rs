//! File helpers shared by every stage.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::{Error, Result};

/// Reads and parses a YAML file. An empty file is a configuration error.
pub fn read_yaml<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {e}", path.display())))?;

    if content.trim().is_empty() {
        return Err(Error::Config(format!(
            "yaml file is empty: {}",
            path.display()
        )));
    }

    let parsed = serde_yaml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {e}", path.display())))?;
    info!("yaml file: {} loaded successfully", path.display());
    Ok(parsed)
}

/// Creates every directory in `paths`, including parents.
pub fn create_directories<P: AsRef<Path>>(paths: &[P], verbose: bool) -> Result<()> {
    for path in paths {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        if verbose {
            info!("created directory at: {}", path.display());
        }
    }
    Ok(())
}

/// Writes `data` as pretty JSON, creating the parent directory if needed.
pub fn save_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(data)?;
    fs::write(path, json)?;
    info!("json file saved at: {}", path.display());
    Ok(())
}

/// File size rendered as `~ N KB`.
pub fn get_size(path: &Path) -> Result<String> {
    let bytes = fs::metadata(path)?.len();
    let kb = (bytes as f64 / 1024.0).round() as u64;
    Ok(format!("~ {kb} KB"))
}
