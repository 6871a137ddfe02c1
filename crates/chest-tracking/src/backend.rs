//! Tracking backend chosen from the tracking URI.

use std::collections::BTreeMap;
use std::path::Path;

use chest_core::Result;

use crate::file_store::FileStore;
use crate::rest_store::{Credentials, RestStore};
use crate::store::{Metric, RunInfo, RunStatus, TrackingStore};
use crate::uri::TrackingUri;

/// A local file store or a remote server. Only `Remote` has a model registry.
#[derive(Debug, Clone)]
pub enum TrackingBackend {
    Local(FileStore),
    Remote(RestStore),
}

impl TrackingBackend {
    /// Builds the backend for `uri`, reading server credentials from the
    /// environment.
    pub fn from_uri(uri: &str) -> Result<Self> {
        match TrackingUri::parse(uri)? {
            TrackingUri::Local(path) => Ok(TrackingBackend::Local(FileStore::new(path))),
            TrackingUri::Remote(url) => Ok(TrackingBackend::Remote(RestStore::new(
                url,
                Credentials::from_env(),
            )?)),
        }
    }

    pub fn supports_registry(&self) -> bool {
        matches!(self, TrackingBackend::Remote(_))
    }

    fn store(&self) -> &dyn TrackingStore {
        match self {
            TrackingBackend::Local(store) => store,
            TrackingBackend::Remote(store) => store,
        }
    }
}

impl TrackingStore for TrackingBackend {
    fn start_run(&self, run_name: &str) -> Result<RunInfo> {
        self.store().start_run(run_name)
    }

    fn log_params(&self, run: &RunInfo, params: &BTreeMap<String, String>) -> Result<()> {
        self.store().log_params(run, params)
    }

    fn log_metrics(&self, run: &RunInfo, metrics: &[Metric]) -> Result<()> {
        self.store().log_metrics(run, metrics)
    }

    fn log_artifact(&self, run: &RunInfo, local_path: &Path, artifact_path: &str) -> Result<()> {
        self.store().log_artifact(run, local_path, artifact_path)
    }

    fn log_artifact_bytes(
        &self,
        run: &RunInfo,
        artifact_path: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<()> {
        self.store()
            .log_artifact_bytes(run, artifact_path, file_name, bytes)
    }

    fn end_run(&self, run: &RunInfo, status: RunStatus) -> Result<()> {
        self.store().end_run(run, status)
    }
}
