//! Logging a model as a run artifact with an `MLmodel` descriptor.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chest_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::store::{RunInfo, TrackingStore};

/// Descriptor written as `<artifact_path>/MLmodel`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlModel {
    pub artifact_path: String,
    /// Flavor name to its properties, e.g. `burn -> {record_file: model.mpk}`
    pub flavors: BTreeMap<String, BTreeMap<String, String>>,
    pub model_uuid: String,
    pub run_id: String,
    pub utc_time_created: String,
}

/// Files that make up one saved model
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub files: Vec<PathBuf>,
    pub flavor: String,
    pub properties: BTreeMap<String, String>,
}

impl ModelArtifact {
    pub fn new(flavor: impl Into<String>) -> Self {
        Self {
            files: Vec::new(),
            flavor: flavor.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Uploads the model files and descriptor under `artifact_path`.
pub fn log_model<S: TrackingStore + ?Sized>(
    store: &S,
    run: &RunInfo,
    artifact_path: &str,
    model: &ModelArtifact,
) -> Result<MlModel> {
    for file in &model.files {
        if !file.is_file() {
            return Err(Error::NotFound(format!("model file {}", file.display())));
        }
    }
    for file in &model.files {
        store.log_artifact(run, file, artifact_path)?;
    }

    let mut flavors = BTreeMap::new();
    flavors.insert(model.flavor.clone(), model.properties.clone());
    let descriptor = MlModel {
        artifact_path: artifact_path.to_string(),
        flavors,
        model_uuid: Uuid::new_v4().simple().to_string(),
        run_id: run.run_id.clone(),
        utc_time_created: chrono::Utc::now()
            .format("%Y-%m-%d %H:%M:%S%.6f")
            .to_string(),
    };
    let yaml = serde_yaml::to_string(&descriptor)?;
    store.log_artifact_bytes(run, artifact_path, "MLmodel", yaml.as_bytes())?;

    info!(
        "Logged model ({} files) to {}/{}",
        model.files.len(),
        run.artifact_uri,
        artifact_path
    );
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::FileStore;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_log_model_writes_descriptor() -> Result<()> {
        let dir = tempdir().unwrap();
        let record = dir.path().join("model.mpk");
        fs::write(&record, b"weights")?;

        let store = FileStore::new(dir.path().join("mlruns"));
        let run = store.start_run("run")?;
        let artifact = ModelArtifact::new("burn")
            .with_file(&record)
            .with_property("record_file", "model.mpk");
        let descriptor = log_model(&store, &run, "model", &artifact)?;

        let written = store.run_dir(&run.run_id).join("artifacts/model/MLmodel");
        let parsed: MlModel = serde_yaml::from_str(&fs::read_to_string(written)?)?;
        assert_eq!(parsed, descriptor);
        assert_eq!(parsed.flavors["burn"]["record_file"], "model.mpk");
        Ok(())
    }

    #[test]
    fn test_missing_model_file() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let run = store.start_run("run").unwrap();
        let artifact = ModelArtifact::new("burn").with_file(dir.path().join("absent.mpk"));
        assert!(matches!(
            log_model(&store, &run, "model", &artifact),
            Err(Error::NotFound(_))
        ));
    }
}
