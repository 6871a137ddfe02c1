//! The run-level operations every tracking store provides.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chest_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Identifies one tracking run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
    /// Root URI under which the run's artifacts are stored
    pub artifact_uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    /// Name used by the REST API
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        }
    }

    /// Numeric code stored in file-store `meta.yaml`
    pub fn code(&self) -> i32 {
        match self {
            RunStatus::Running => 1,
            RunStatus::Finished => 3,
            RunStatus::Failed => 4,
            RunStatus::Killed => 5,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single metric observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub key: String,
    pub value: f64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub step: i64,
}

impl Metric {
    /// Observation at step 0, timestamped now
    pub fn now(key: impl Into<String>, value: f64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp: now_millis(),
            step: 0,
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Operations on a single run. Implemented by each store and by
/// [`crate::TrackingBackend`], which dispatches on the URI scheme.
pub trait TrackingStore {
    /// Opens a run in the default experiment
    fn start_run(&self, run_name: &str) -> Result<RunInfo>;

    fn log_params(&self, run: &RunInfo, params: &BTreeMap<String, String>) -> Result<()>;

    fn log_metrics(&self, run: &RunInfo, metrics: &[Metric]) -> Result<()>;

    /// Copies a local file under `artifact_path` in the run's artifacts
    fn log_artifact(&self, run: &RunInfo, local_path: &Path, artifact_path: &str) -> Result<()>;

    /// Stores `bytes` as `artifact_path/file_name`
    fn log_artifact_bytes(
        &self,
        run: &RunInfo,
        artifact_path: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<()>;

    fn end_run(&self, run: &RunInfo, status: RunStatus) -> Result<()>;
}

/// Rejects keys that are empty or could escape the run directory.
pub fn validate_key(kind: &str, key: &str) -> Result<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' ' | '/');
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part == ".." || part.is_empty())
        || !key.chars().all(allowed)
    {
        return Err(Error::InvalidArgument(format!("invalid {kind} name '{key}'")));
    }
    Ok(())
}
