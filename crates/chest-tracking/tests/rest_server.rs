//! `RestStore` against a mock tracking server.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::Json;
use axum::Router;
use chest_tracking::{
    log_model, Metric, ModelArtifact, RunStatus, TrackingBackend, TrackingStore,
};
use serde_json::{json, Value};

#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    path: String,
    body: Vec<u8>,
}

type Log = Arc<Mutex<Vec<Recorded>>>;

async fn handle(State(log): State<Log>, method: Method, uri: Uri, body: Bytes) -> (StatusCode, Json<Value>) {
    let path = uri.path().to_string();
    log.lock().unwrap().push(Recorded {
        method,
        path: path.clone(),
        body: body.to_vec(),
    });

    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    match path.as_str() {
        "/api/2.0/mlflow/runs/create" => (
            StatusCode::OK,
            Json(json!({ "run": { "info": {
                "run_id": "run-1",
                "experiment_id": "0",
                "artifact_uri": "mlflow-artifacts:/0/run-1/artifacts",
                "status": "RUNNING"
            }}})),
        ),
        "/api/2.0/mlflow/registered-models/create" if request["name"] == "Existing" => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error_code": "RESOURCE_ALREADY_EXISTS",
                "message": "Registered Model (name=Existing) already exists."
            })),
        ),
        "/api/2.0/mlflow/registered-models/create" => (
            StatusCode::OK,
            Json(json!({ "registered_model": { "name": request["name"] } })),
        ),
        "/api/2.0/mlflow/model-versions/create" => (
            StatusCode::OK,
            Json(json!({ "model_version": {
                "name": request["name"],
                "version": "1",
                "status": "READY"
            }})),
        ),
        "/api/2.0/mlflow/runs/log-batch" if request["metrics"][0]["key"] == "explode" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error_code": "INTERNAL_ERROR", "message": "boom" })),
        ),
        _ => (StatusCode::OK, Json(json!({}))),
    }
}

fn spawn_server() -> (SocketAddr, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let state = log.clone();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let app = Router::new().fallback(handle).with_state(state);
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
    });
    (rx.recv().unwrap(), log)
}

fn paths(log: &Log) -> Vec<String> {
    log.lock().unwrap().iter().map(|r| r.path.clone()).collect()
}

#[test]
fn test_full_run_with_registration() {
    let (addr, log) = spawn_server();
    let backend = TrackingBackend::from_uri(&format!("http://{addr}")).unwrap();
    let TrackingBackend::Remote(store) = &backend else {
        panic!("http URI must select the remote store");
    };

    let dir = tempfile::tempdir().unwrap();
    let record = dir.path().join("model.mpk");
    std::fs::write(&record, b"weights").unwrap();

    let run = backend.start_run("evaluation").unwrap();
    assert_eq!(run.run_id, "run-1");

    let mut params = BTreeMap::new();
    params.insert("EPOCHS".to_string(), "1".to_string());
    backend.log_params(&run, &params).unwrap();
    backend
        .log_metrics(&run, &[Metric::now("loss", 0.4), Metric::now("accuracy", 0.9)])
        .unwrap();

    let artifact = ModelArtifact::new("burn").with_file(&record);
    log_model(&backend, &run, "model", &artifact).unwrap();
    let version = store.register_model(&run, "model", "VGG16Model").unwrap();
    assert_eq!(version.version, "1");
    backend.end_run(&run, RunStatus::Finished).unwrap();

    let recorded = log.lock().unwrap().clone();
    let seen = paths(&log);
    assert_eq!(seen[0], "/api/2.0/mlflow/runs/create");
    assert!(seen.contains(&"/api/2.0/mlflow-artifacts/artifacts/0/run-1/artifacts/model/model.mpk".to_string()));
    assert!(seen.contains(&"/api/2.0/mlflow-artifacts/artifacts/0/run-1/artifacts/model/MLmodel".to_string()));

    let upload = recorded
        .iter()
        .find(|r| r.path.ends_with("/model/model.mpk"))
        .unwrap();
    assert_eq!(upload.method, Method::PUT);
    assert_eq!(upload.body, b"weights");

    let version_request = recorded
        .iter()
        .find(|r| r.path == "/api/2.0/mlflow/model-versions/create")
        .unwrap();
    let body: Value = serde_json::from_slice(&version_request.body).unwrap();
    assert_eq!(body["name"], "VGG16Model");
    assert_eq!(body["source"], "mlflow-artifacts:/0/run-1/artifacts/model");
    assert_eq!(body["run_id"], "run-1");

    let update = recorded.last().unwrap();
    assert_eq!(update.path, "/api/2.0/mlflow/runs/update");
    let body: Value = serde_json::from_slice(&update.body).unwrap();
    assert_eq!(body["status"], "FINISHED");
}

#[test]
fn test_existing_registered_model_is_reused() {
    let (addr, log) = spawn_server();
    let backend = TrackingBackend::from_uri(&format!("http://{addr}")).unwrap();
    let TrackingBackend::Remote(store) = &backend else {
        panic!("http URI must select the remote store");
    };

    let run = backend.start_run("run").unwrap();
    let version = store.register_model(&run, "model", "Existing").unwrap();
    assert_eq!(version.name, "Existing");
    assert!(paths(&log).contains(&"/api/2.0/mlflow/model-versions/create".to_string()));
}

#[test]
fn test_server_error_is_reported() {
    let (addr, _log) = spawn_server();
    let backend = TrackingBackend::from_uri(&format!("http://{addr}")).unwrap();
    let run = backend.start_run("run").unwrap();

    let err = backend
        .log_metrics(&run, &[Metric::now("explode", 1.0)])
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("INTERNAL_ERROR"), "{message}");
}
