//! Local tracking store using the MLflow file-store layout.
//!
//! ```text
//! <root>/0/meta.yaml                  default experiment
//! <root>/0/<run_id>/meta.yaml         run info and status
//! <root>/0/<run_id>/params/<key>      one value per file
//! <root>/0/<run_id>/metrics/<key>     "<timestamp> <value> <step>" lines
//! <root>/0/<run_id>/tags/<key>
//! <root>/0/<run_id>/artifacts/...
//! ```

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chest_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::store::{now_millis, validate_key, Metric, RunInfo, RunStatus, TrackingStore};

pub const DEFAULT_EXPERIMENT_ID: &str = "0";
const SOURCE_TYPE_LOCAL: i32 = 4;

#[derive(Debug, Serialize, Deserialize)]
struct ExperimentMeta {
    artifact_location: String,
    creation_time: i64,
    experiment_id: String,
    last_update_time: i64,
    lifecycle_stage: String,
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunMeta {
    artifact_uri: String,
    end_time: Option<i64>,
    entry_point_name: String,
    experiment_id: String,
    lifecycle_stage: String,
    run_id: String,
    run_name: String,
    run_uuid: String,
    source_name: String,
    source_type: i32,
    source_version: String,
    start_time: i64,
    status: i32,
    tags: Vec<String>,
    user_id: String,
}

/// Tracking store rooted at a local directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a run in the default experiment
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(DEFAULT_EXPERIMENT_ID).join(run_id)
    }

    fn ensure_default_experiment(&self) -> Result<PathBuf> {
        let experiment_dir = self.root.join(DEFAULT_EXPERIMENT_ID);
        fs::create_dir_all(&experiment_dir)?;
        let experiment_dir = fs::canonicalize(&experiment_dir)?;

        let meta_path = experiment_dir.join("meta.yaml");
        if !meta_path.exists() {
            let now = now_millis();
            let meta = ExperimentMeta {
                artifact_location: file_uri(&experiment_dir)?,
                creation_time: now,
                experiment_id: DEFAULT_EXPERIMENT_ID.to_string(),
                last_update_time: now,
                lifecycle_stage: "active".to_string(),
                name: "Default".to_string(),
            };
            fs::write(&meta_path, serde_yaml::to_string(&meta)?)?;
            debug!("Created default experiment at {}", experiment_dir.display());
        }
        Ok(experiment_dir)
    }

    fn read_run_meta(&self, run_id: &str) -> Result<RunMeta> {
        let path = self.run_dir(run_id).join("meta.yaml");
        let content = fs::read_to_string(&path)
            .map_err(|_| Error::NotFound(format!("run '{run_id}' in {}", self.root.display())))?;
        Ok(serde_yaml::from_str(&content)?)
    }

    fn write_run_meta(&self, meta: &RunMeta) -> Result<()> {
        let path = self.run_dir(&meta.run_id).join("meta.yaml");
        fs::write(path, serde_yaml::to_string(meta)?)?;
        Ok(())
    }

    fn write_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let path = self.run_dir(run_id).join("tags").join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, value)?;
        Ok(())
    }

    fn artifact_dir(&self, run: &RunInfo, artifact_path: &str) -> Result<PathBuf> {
        let mut dir = self.run_dir(&run.run_id).join("artifacts");
        if !artifact_path.is_empty() {
            validate_key("artifact path", artifact_path)?;
            dir = dir.join(artifact_path);
        }
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

fn file_uri(path: &Path) -> Result<String> {
    Url::from_file_path(path)
        .map(|url| url.to_string())
        .map_err(|_| Error::Tracking(format!("cannot build file URI for {}", path.display())))
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

impl TrackingStore for FileStore {
    fn start_run(&self, run_name: &str) -> Result<RunInfo> {
        let experiment_dir = self.ensure_default_experiment()?;
        let run_id = Uuid::new_v4().simple().to_string();
        let run_dir = experiment_dir.join(&run_id);
        for sub in ["params", "metrics", "tags", "artifacts"] {
            fs::create_dir_all(run_dir.join(sub))?;
        }

        let artifact_uri = file_uri(&run_dir.join("artifacts"))?;
        let user = current_user();
        let meta = RunMeta {
            artifact_uri: artifact_uri.clone(),
            end_time: None,
            entry_point_name: String::new(),
            experiment_id: DEFAULT_EXPERIMENT_ID.to_string(),
            lifecycle_stage: "active".to_string(),
            run_id: run_id.clone(),
            run_name: run_name.to_string(),
            run_uuid: run_id.clone(),
            source_name: String::new(),
            source_type: SOURCE_TYPE_LOCAL,
            source_version: String::new(),
            start_time: now_millis(),
            status: RunStatus::Running.code(),
            tags: Vec::new(),
            user_id: user.clone(),
        };
        self.write_run_meta(&meta)?;
        self.write_tag(&run_id, "mlflow.runName", run_name)?;
        self.write_tag(&run_id, "mlflow.user", &user)?;
        self.write_tag(&run_id, "mlflow.source.type", "LOCAL")?;

        info!("Started local run {} in {}", run_id, self.root.display());
        Ok(RunInfo {
            run_id,
            experiment_id: DEFAULT_EXPERIMENT_ID.to_string(),
            artifact_uri,
        })
    }

    fn log_params(&self, run: &RunInfo, params: &BTreeMap<String, String>) -> Result<()> {
        let params_dir = self.run_dir(&run.run_id).join("params");
        for (key, value) in params {
            validate_key("param", key)?;
            let path = params_dir.join(key);
            if let Ok(existing) = fs::read_to_string(&path) {
                if &existing != value {
                    return Err(Error::Tracking(format!(
                        "param '{key}' already logged as '{existing}', refusing to change it to '{value}'"
                    )));
                }
                continue;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, value)?;
        }
        debug!("Logged {} params to run {}", params.len(), run.run_id);
        Ok(())
    }

    fn log_metrics(&self, run: &RunInfo, metrics: &[Metric]) -> Result<()> {
        let metrics_dir = self.run_dir(&run.run_id).join("metrics");
        for metric in metrics {
            validate_key("metric", &metric.key)?;
            let path = metrics_dir.join(&metric.key);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{} {} {}", metric.timestamp, metric.value, metric.step)?;
        }
        debug!("Logged {} metrics to run {}", metrics.len(), run.run_id);
        Ok(())
    }

    fn log_artifact(&self, run: &RunInfo, local_path: &Path, artifact_path: &str) -> Result<()> {
        let file_name = local_path
            .file_name()
            .ok_or_else(|| Error::InvalidArgument(format!("not a file: {}", local_path.display())))?;
        let dest = self.artifact_dir(run, artifact_path)?.join(file_name);
        fs::copy(local_path, &dest).map_err(|e| {
            Error::Tracking(format!("failed to copy {}: {e}", local_path.display()))
        })?;
        debug!("Logged artifact {}", dest.display());
        Ok(())
    }

    fn log_artifact_bytes(
        &self,
        run: &RunInfo,
        artifact_path: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<()> {
        validate_key("artifact file", file_name)?;
        let dest = self.artifact_dir(run, artifact_path)?.join(file_name);
        fs::write(&dest, bytes)?;
        Ok(())
    }

    fn end_run(&self, run: &RunInfo, status: RunStatus) -> Result<()> {
        let mut meta = self.read_run_meta(&run.run_id)?;
        meta.status = status.code();
        meta.end_time = Some(now_millis());
        self.write_run_meta(&meta)?;
        info!("Run {} ended with status {}", run.run_id, status);
        Ok(())
    }
}
