//! Experiment tracking against MLflow-compatible stores.
//!
//! The tracking URI decides the store: `file:` URIs and plain paths write the
//! MLflow file-store layout locally, `http(s)` URIs talk to a tracking server
//! over its REST API. Only server stores carry a model registry.

pub mod backend;
pub mod file_store;
pub mod model;
pub mod rest_store;
pub mod store;
pub mod uri;

pub use backend::TrackingBackend;
pub use file_store::FileStore;
pub use model::{log_model, MlModel, ModelArtifact};
pub use rest_store::{Credentials, ModelVersion, RestStore};
pub use store::{Metric, RunInfo, RunStatus, TrackingStore};
pub use uri::TrackingUri;
