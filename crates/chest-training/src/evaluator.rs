//! Evaluation stage: score the trained model, persist the score and publish
//! the run to the tracking server.

use std::path::{Path, PathBuf};

use burn::{data::dataloader::batcher::Batcher, tensor::backend::Backend};
use chest_core::{save_json, Error, EvaluationConfig, Result, Score};
use chest_dataset::{GeneratorConfig, ImageBatcher, ImageGenerator, Subset};
use chest_tracking::{
    log_model, Metric, ModelArtifact, ModelVersion, RunInfo, RunStatus, TrackingBackend,
    TrackingStore,
};
use tracing::{debug, info, warn};

use crate::artifact::{load_classifier, record_path, sidecar_path};
use crate::metrics::{batch_stats, Tally};
use crate::model::ClassifierModel;

/// Artifact directory of the logged model inside the run
pub const MODEL_ARTIFACT_PATH: &str = "model";

/// Scores `model` over at most `max_batches` batches of epoch 0 of `generator`.
pub fn evaluate_generator<B: Backend>(
    model: &ClassifierModel<B>,
    generator: &ImageGenerator,
    max_batches: usize,
    device: &B::Device,
) -> Result<Score> {
    let batcher = ImageBatcher::<B>::new(generator.image_size());
    let mut tally = Tally::default();

    for items in generator.epoch(0).take(max_batches) {
        let items = items?;
        let batch_size = items.len();
        let batch = batcher.batch(items, device);
        let (loss, correct) = batch_stats(model.forward(batch.images), batch.targets);
        tally.add(loss, correct, batch_size);
    }

    tally
        .score()
        .ok_or_else(|| Error::Dataset("no validation samples to evaluate".to_string()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Result of [`Evaluation::publish`]
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub run_id: String,
    pub artifact_uri: String,
    /// Set when the backend has a model registry
    pub registered: Option<ModelVersion>,
}

pub struct Evaluation {
    config: EvaluationConfig,
    score: Option<Score>,
}

impl Evaluation {
    pub fn new(config: EvaluationConfig) -> Self {
        Self {
            config,
            score: None,
        }
    }

    pub fn score(&self) -> Option<Score> {
        self.score
    }

    /// Loads the trained model and scores it on every image under
    /// `validation_data`, in a fixed order.
    pub fn evaluate<B: Backend>(&mut self, device: &B::Device) -> Result<Score> {
        let (model, model_config) = load_classifier::<B>(&self.config.path_of_model, device)?;

        let generator = ImageGenerator::flow_from_directory(
            &self.config.validation_data,
            0.0,
            Subset::All,
            GeneratorConfig::validation(self.config.params_image_size, self.config.params_batch_size),
        )?;
        if generator.class_names().len() != model_config.num_classes {
            return Err(Error::Dataset(format!(
                "model predicts {} classes but {} has {} ({})",
                model_config.num_classes,
                self.config.validation_data.display(),
                generator.class_names().len(),
                generator.class_names().join(", ")
            )));
        }
        info!(
            "Evaluating on {} images from {}",
            generator.samples(),
            self.config.validation_data.display()
        );

        let score = evaluate_generator(&model, &generator, generator.num_batches(), device)?;
        info!(
            "Evaluation: loss = {:.4}, accuracy = {:.2}%",
            score.loss,
            score.accuracy * 100.0
        );
        self.score = Some(score);
        Ok(score)
    }

    fn require_score(&self) -> Result<Score> {
        self.score.ok_or_else(|| {
            Error::InvalidArgument("no score yet, evaluate() must run first".to_string())
        })
    }

    /// The score, rejected when it cannot be written as JSON numbers
    fn finite_score(&self) -> Result<Score> {
        let score = self.require_score()?;
        if !score.is_finite() {
            return Err(Error::Serialization(format!(
                "score is not finite (loss={}, accuracy={})",
                score.loss, score.accuracy
            )));
        }
        Ok(score)
    }

    /// Writes `{"loss": .., "accuracy": ..}` to `score_path`.
    pub fn persist_score(&self) -> Result<PathBuf> {
        let score = self.finite_score()?;
        save_json(&self.config.score_path, &score)?;
        info!("Saved score to {}", self.config.score_path.display());
        Ok(self.config.score_path.clone())
    }

    /// Logs params, metrics and the model to a new tracking run. The model is
    /// registered as `registered_model_name` when the backend has a registry.
    pub fn publish(&self, registered_model_name: &str) -> Result<PublishOutcome> {
        let score = self.finite_score()?;
        let backend = TrackingBackend::from_uri(&self.config.mlflow_uri)?;
        info!("Tracking run at {}", self.config.mlflow_uri);

        let run = backend.start_run("evaluation")?;
        match self.log_run(&backend, &run, score, registered_model_name) {
            Ok(registered) => {
                backend.end_run(&run, RunStatus::Finished)?;
                Ok(PublishOutcome {
                    run_id: run.run_id,
                    artifact_uri: run.artifact_uri,
                    registered,
                })
            }
            Err(err) => {
                if let Err(end_err) = backend.end_run(&run, RunStatus::Failed) {
                    warn!("Could not mark run {} as failed: {end_err}", run.run_id);
                }
                Err(err)
            }
        }
    }

    fn log_run(
        &self,
        backend: &TrackingBackend,
        run: &RunInfo,
        score: Score,
        registered_model_name: &str,
    ) -> Result<Option<ModelVersion>> {
        backend.log_params(run, &self.config.all_params)?;
        backend.log_metrics(
            run,
            &[
                Metric::now("loss", score.loss),
                Metric::now("accuracy", score.accuracy),
            ],
        )?;

        let record = record_path(&self.config.path_of_model);
        let config_file = sidecar_path(&self.config.path_of_model);
        let artifact = ModelArtifact::new("burn")
            .with_file(&record)
            .with_file(&config_file)
            .with_property("record_file", file_name(&record))
            .with_property("config_file", file_name(&config_file))
            .with_property("recorder", "CompactRecorder");
        log_model(backend, run, MODEL_ARTIFACT_PATH, &artifact)?;

        match backend {
            TrackingBackend::Remote(store) => {
                let version =
                    store.register_model(run, MODEL_ARTIFACT_PATH, registered_model_name)?;
                info!(
                    "Registered model {} version {}",
                    version.name, version.version
                );
                Ok(Some(version))
            }
            TrackingBackend::Local(_) => {
                debug!("Local tracking store has no model registry, skipping registration");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn config(root: &std::path::Path) -> EvaluationConfig {
        EvaluationConfig {
            path_of_model: root.join("model.mpk"),
            validation_data: root.join("data"),
            mlflow_uri: format!("file://{}", root.join("mlruns").display()),
            all_params: BTreeMap::new(),
            params_image_size: chest_core::ImageSize::new(16, 16),
            params_batch_size: 4,
            score_path: root.join("scores.json"),
            registered_model_name: "VGG16Model".to_string(),
        }
    }

    #[test]
    fn test_missing_model_fails_before_data() {
        let dir = tempdir().unwrap();
        let mut evaluation = Evaluation::new(config(dir.path()));
        let result = evaluation.evaluate::<burn_ndarray::NdArray>(&Default::default());
        assert!(matches!(result, Err(Error::NotFound(message)) if message.contains("model.mpk")));
    }

    #[test]
    fn test_persist_requires_score() {
        let dir = tempdir().unwrap();
        let evaluation = Evaluation::new(config(dir.path()));
        assert!(matches!(evaluation.persist_score(), Err(Error::InvalidArgument(_))));
        assert!(evaluation.publish("VGG16Model").is_err());
    }

    #[test]
    fn test_persist_score_json() {
        let dir = tempdir().unwrap();
        let mut evaluation = Evaluation::new(config(dir.path()));
        evaluation.score = Some(Score {
            loss: 0.25,
            accuracy: 0.75,
        });
        let path = evaluation.persist_score().unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["loss"], 0.25);
        assert_eq!(value["accuracy"], 0.75);
        assert_eq!(value.as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_non_finite_score_not_persisted() {
        let dir = tempdir().unwrap();
        let mut evaluation = Evaluation::new(config(dir.path()));
        evaluation.score = Some(Score {
            loss: f64::NAN,
            accuracy: 0.5,
        });
        assert!(matches!(evaluation.persist_score(), Err(Error::Serialization(_))));
        assert!(!dir.path().join("scores.json").exists());
    }

    fn only_run_dir(mlruns: &std::path::Path) -> std::path::PathBuf {
        let runs: Vec<_> = std::fs::read_dir(mlruns.join("0"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.is_dir())
            .collect();
        assert_eq!(runs.len(), 1, "{runs:?}");
        runs[0].clone()
    }

    #[test]
    fn test_publish_model_saved_under_other_extension() {
        use crate::model::{BaseModelConfig, ClassifierConfig};
        use crate::save_classifier;
        use chest_core::{BaseArchitecture, FreezePolicy, ImageSize};

        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.path_of_model = dir.path().join("training/model.h5");

        let model_config = ClassifierConfig::new(
            BaseModelConfig::new(BaseArchitecture::Compact, ImageSize::new(16, 16)),
            2,
            FreezePolicy::All,
        );
        let model = model_config.init::<burn_ndarray::NdArray>(&Default::default());
        save_classifier(&model, &model_config, &config.path_of_model).unwrap();

        let mut evaluation = Evaluation::new(config);
        evaluation.score = Some(Score {
            loss: 0.5,
            accuracy: 0.5,
        });
        let outcome = evaluation.publish("VGG16Model").unwrap();
        assert!(outcome.registered.is_none());

        let run_dir = only_run_dir(&dir.path().join("mlruns"));
        assert!(run_dir.join("artifacts/model/model.mpk").is_file());
        assert!(run_dir.join("artifacts/model/model.json").is_file());
        let descriptor = std::fs::read_to_string(run_dir.join("artifacts/model/MLmodel")).unwrap();
        assert!(descriptor.contains("record_file: model.mpk"), "{descriptor}");
    }

    #[test]
    fn test_failed_publish_marks_run_failed() {
        let dir = tempdir().unwrap();
        let mut evaluation = Evaluation::new(config(dir.path()));
        evaluation.score = Some(Score {
            loss: 0.5,
            accuracy: 0.5,
        });

        let result = evaluation.publish("VGG16Model");
        assert!(matches!(result, Err(Error::NotFound(_))));

        let run_dir = only_run_dir(&dir.path().join("mlruns"));
        let meta = std::fs::read_to_string(run_dir.join("meta.yaml")).unwrap();
        assert!(meta.contains("status: 4"), "{meta}");
        // params and metrics were logged before the model upload failed
        assert!(run_dir.join("metrics/loss").is_file());
    }

    #[test]
    fn test_non_finite_score_not_published() {
        let dir = tempdir().unwrap();
        let mut evaluation = Evaluation::new(config(dir.path()));
        evaluation.score = Some(Score {
            loss: f64::INFINITY,
            accuracy: 0.5,
        });
        assert!(matches!(
            evaluation.publish("VGG16Model"),
            Err(Error::Serialization(_))
        ));
        assert!(!dir.path().join("mlruns").exists());
    }
}
