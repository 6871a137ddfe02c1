//! Tracking server client speaking the MLflow REST API 2.0.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use chest_core::{Error, Result};
use reqwest::blocking::{Body, Client, RequestBuilder};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use crate::store::{now_millis, validate_key, Metric, RunInfo, RunStatus, TrackingStore};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_PARAMS_PER_BATCH: usize = 100;
const MAX_METRICS_PER_BATCH: usize = 1000;

/// Credentials for the tracking server
#[derive(Clone)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::Bearer(_) => f.write_str("Bearer(..)"),
        }
    }
}

impl Credentials {
    /// Reads `MLFLOW_TRACKING_USERNAME`/`MLFLOW_TRACKING_PASSWORD`, falling
    /// back to `MLFLOW_TRACKING_TOKEN`.
    pub fn from_env() -> Option<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        match (var("MLFLOW_TRACKING_USERNAME"), var("MLFLOW_TRACKING_PASSWORD")) {
            (Some(username), Some(password)) => Some(Credentials::Basic { username, password }),
            _ => var("MLFLOW_TRACKING_TOKEN").map(Credentials::Bearer),
        }
    }

    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Credentials::Basic { username, password } => request.basic_auth(username, Some(password)),
            Credentials::Bearer(token) => request.bearer_auth(token),
        }
    }
}

/// A registered model version
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct CreateRunResponse {
    run: RunEnvelope,
}

#[derive(Deserialize)]
struct RunEnvelope {
    info: RunInfoDto,
}

#[derive(Deserialize)]
struct RunInfoDto {
    run_id: String,
    experiment_id: String,
    artifact_uri: String,
}

#[derive(Deserialize)]
struct CreateModelVersionResponse {
    model_version: ModelVersion,
}

#[derive(Serialize)]
struct KeyValue<'a> {
    key: &'a str,
    value: &'a str,
}

/// Failure returned by the server, kept so callers can inspect the code
struct Rejected {
    status: StatusCode,
    error_code: String,
    message: String,
}

/// Store backed by a remote tracking server
#[derive(Debug, Clone)]
pub struct RestStore {
    base: Url,
    client: Client,
    credentials: Option<Credentials>,
}

impl RestStore {
    pub fn new(base: Url, credentials: Option<Credentials>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Tracking(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            base,
            client,
            credentials,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/api/2.0/{}",
            self.base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(credentials) => credentials.apply(request),
            None => request,
        }
    }

    /// POSTs `body` and returns the parsed response or the server's rejection.
    fn try_post<T, R>(&self, path: &str, body: &T) -> Result<std::result::Result<R, Rejected>>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint(path);
        debug!("POST {}", url);
        let response = self
            .authorized(self.client.post(&url).json(body))
            .send()
            .map_err(|e| Error::Tracking(format!("{url}: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|e| Error::Tracking(format!("{url}: {e}")))?;

        if !status.is_success() {
            let api_error: ApiError = serde_json::from_str(&text).unwrap_or(ApiError {
                error_code: String::new(),
                message: text.clone(),
            });
            return Ok(Err(Rejected {
                status,
                error_code: api_error.error_code,
                message: api_error.message,
            }));
        }

        // Several endpoints answer with an empty body
        let text = if text.trim().is_empty() { "{}" } else { text.as_str() };
        let parsed = serde_json::from_str(text)
            .map_err(|e| Error::Tracking(format!("{url}: unexpected response: {e}")))?;
        Ok(Ok(parsed))
    }

    fn post<T, R>(&self, path: &str, body: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.try_post(path, body)?
            .map_err(|rejected| rejection_error(path, rejected))
    }

    /// URL that accepts a `PUT` of one artifact file.
    fn artifact_url(&self, run: &RunInfo, artifact_path: &str, file_name: &str) -> Result<String> {
        let root = Url::parse(&run.artifact_uri).map_err(|e| {
            Error::Tracking(format!("invalid artifact URI '{}': {e}", run.artifact_uri))
        })?;
        let mut relative = String::new();
        if !artifact_path.is_empty() {
            relative.push_str(artifact_path.trim_matches('/'));
            relative.push('/');
        }
        relative.push_str(file_name);

        match root.scheme() {
            "mlflow-artifacts" => Ok(format!(
                "{}/{}",
                self.endpoint(&format!(
                    "mlflow-artifacts/artifacts/{}",
                    root.path().trim_matches('/')
                )),
                relative
            )),
            "http" | "https" => Ok(format!("{}/{}", root.as_str().trim_end_matches('/'), relative)),
            other => Err(Error::Tracking(format!(
                "artifact URI scheme '{other}' is not supported for upload"
            ))),
        }
    }

    fn put_artifact(&self, url: &str, body: Body) -> Result<()> {
        debug!("PUT {}", url);
        let response = self
            .authorized(self.client.put(url).body(body))
            .send()
            .map_err(|e| Error::Tracking(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(Error::Tracking(format!(
                "artifact upload to {url} failed with {status}: {text}"
            )));
        }
        Ok(())
    }

    /// Registers `<artifact_uri>/<artifact_path>` under `name`, creating the
    /// registered model first when it does not exist yet.
    pub fn register_model(&self, run: &RunInfo, artifact_path: &str, name: &str) -> Result<ModelVersion> {
        let created: std::result::Result<serde_json::Value, Rejected> =
            self.try_post("mlflow/registered-models/create", &json!({ "name": name }))?;
        match created {
            Ok(_) => info!("Successfully registered model '{}'", name),
            Err(rejected) if rejected.error_code == "RESOURCE_ALREADY_EXISTS" => {
                info!("Registered model '{}' already exists, adding a new version", name)
            }
            Err(rejected) => {
                return Err(rejection_error("mlflow/registered-models/create", rejected))
            }
        }

        let source = format!(
            "{}/{}",
            run.artifact_uri.trim_end_matches('/'),
            artifact_path.trim_matches('/')
        );
        let response: CreateModelVersionResponse = self.post(
            "mlflow/model-versions/create",
            &json!({ "name": name, "source": source, "run_id": run.run_id }),
        )?;
        info!(
            "Created version {} of registered model '{}'",
            response.model_version.version, name
        );
        Ok(response.model_version)
    }
}

fn rejection_error(path: &str, rejected: Rejected) -> Error {
    Error::Tracking(format!(
        "{path} failed with {}: {} {}",
        rejected.status, rejected.error_code, rejected.message
    ))
}

impl TrackingStore for RestStore {
    fn start_run(&self, run_name: &str) -> Result<RunInfo> {
        let body = json!({
            "experiment_id": "0",
            "start_time": now_millis(),
            "run_name": run_name,
            "tags": [
                { "key": "mlflow.runName", "value": run_name },
                { "key": "mlflow.source.type", "value": "LOCAL" },
            ],
        });
        let response: CreateRunResponse = self.post("mlflow/runs/create", &body)?;
        let info = response.run.info;
        info!("Started run {} on {}", info.run_id, self.base);
        Ok(RunInfo {
            run_id: info.run_id,
            experiment_id: info.experiment_id,
            artifact_uri: info.artifact_uri,
        })
    }

    fn log_params(&self, run: &RunInfo, params: &BTreeMap<String, String>) -> Result<()> {
        let entries: Vec<KeyValue<'_>> = params
            .iter()
            .map(|(key, value)| {
                validate_key("param", key)?;
                Ok(KeyValue { key, value })
            })
            .collect::<Result<_>>()?;

        for chunk in entries.chunks(MAX_PARAMS_PER_BATCH) {
            let _: serde_json::Value = self.post(
                "mlflow/runs/log-batch",
                &json!({ "run_id": run.run_id, "params": chunk }),
            )?;
        }
        debug!("Logged {} params to run {}", params.len(), run.run_id);
        Ok(())
    }

    fn log_metrics(&self, run: &RunInfo, metrics: &[Metric]) -> Result<()> {
        for metric in metrics {
            validate_key("metric", &metric.key)?;
        }
        for chunk in metrics.chunks(MAX_METRICS_PER_BATCH) {
            let _: serde_json::Value = self.post(
                "mlflow/runs/log-batch",
                &json!({ "run_id": run.run_id, "metrics": chunk }),
            )?;
        }
        debug!("Logged {} metrics to run {}", metrics.len(), run.run_id);
        Ok(())
    }

    fn log_artifact(&self, run: &RunInfo, local_path: &Path, artifact_path: &str) -> Result<()> {
        let file_name = local_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::InvalidArgument(format!("not a file: {}", local_path.display())))?;
        if !artifact_path.is_empty() {
            validate_key("artifact path", artifact_path)?;
        }
        let url = self.artifact_url(run, artifact_path, file_name)?;
        let file = File::open(local_path)?;
        self.put_artifact(&url, Body::from(file))
    }

    fn log_artifact_bytes(
        &self,
        run: &RunInfo,
        artifact_path: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<()> {
        validate_key("artifact file", file_name)?;
        if !artifact_path.is_empty() {
            validate_key("artifact path", artifact_path)?;
        }
        let url = self.artifact_url(run, artifact_path, file_name)?;
        self.put_artifact(&url, Body::from(bytes.to_vec()))
    }

    fn end_run(&self, run: &RunInfo, status: RunStatus) -> Result<()> {
        let _: serde_json::Value = self.post(
            "mlflow/runs/update",
            &json!({
                "run_id": run.run_id,
                "status": status.as_str(),
                "end_time": now_millis(),
            }),
        )?;
        info!("Run {} ended with status {}", run.run_id, status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(base: &str) -> RestStore {
        RestStore::new(Url::parse(base).unwrap(), None).unwrap()
    }

    fn run(artifact_uri: &str) -> RunInfo {
        RunInfo {
            run_id: "abc".to_string(),
            experiment_id: "0".to_string(),
            artifact_uri: artifact_uri.to_string(),
        }
    }

    #[test]
    fn test_endpoint_joins_base_path() {
        let s = store("https://dagshub.com/user/repo.mlflow/");
        assert_eq!(
            s.endpoint("mlflow/runs/create"),
            "https://dagshub.com/user/repo.mlflow/api/2.0/mlflow/runs/create"
        );
    }

    #[test]
    fn test_proxied_artifact_url() {
        let s = store("http://localhost:5000");
        let url = s
            .artifact_url(&run("mlflow-artifacts:/0/abc/artifacts"), "model", "MLmodel")
            .unwrap();
        assert_eq!(
            url,
            "http://localhost:5000/api/2.0/mlflow-artifacts/artifacts/0/abc/artifacts/model/MLmodel"
        );
    }

    #[test]
    fn test_unsupported_artifact_scheme() {
        let s = store("http://localhost:5000");
        assert!(s
            .artifact_url(&run("s3://bucket/0/abc/artifacts"), "model", "f")
            .is_err());
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let creds = Credentials::Basic {
            username: "user".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
