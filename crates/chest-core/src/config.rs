//! Configuration files and the per-stage configuration records built from them.
//!
//! Two YAML files drive the pipeline: `config/config.yaml` describes where
//! artifacts live and `params.yaml` holds the hyperparameters. The
//! [`ConfigurationManager`] reads both once and hands each stage a flat,
//! immutable record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::debug;

use crate::common::{create_directories, read_yaml};
use crate::types::{BaseArchitecture, FreezePolicy, ImageSize};
use crate::{Error, Result};

/// Environment variable that overrides `evaluation.mlflow_uri`.
pub const TRACKING_URI_ENV: &str = "MLFLOW_TRACKING_URI";

// --------------------------------------------------------------------------------
// FILE SCHEMAS
// --------------------------------------------------------------------------------

/// Layout of `config/config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Directory that holds every stage's output
    pub artifacts_root: PathBuf,
    pub data_ingestion: DataIngestionConfig,
    pub prepare_base_model: PrepareBaseModelSection,
    pub training: TrainingSection,
    pub evaluation: EvaluationSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareBaseModelSection {
    pub root_dir: PathBuf,
    /// Backbone without the classification head
    pub base_model_path: PathBuf,
    /// Backbone plus head, input to training
    pub updated_base_model_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSection {
    pub root_dir: PathBuf,
    pub trained_model_path: PathBuf,
    /// Directory with one sub-directory per class
    pub training_data: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSection {
    /// Directory with one sub-directory per class, scored without shuffling
    pub validation_data: PathBuf,
    pub mlflow_uri: String,
    #[serde(default = "default_score_path")]
    pub score_path: PathBuf,
    #[serde(default = "default_registered_model_name")]
    pub registered_model_name: String,
}

fn default_score_path() -> PathBuf {
    PathBuf::from("scores.json")
}

fn default_registered_model_name() -> String {
    "VGG16Model".to_string()
}

/// Hyperparameters from `params.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Params {
    /// Random affine augmentation of training images
    pub augmentation: bool,
    pub image_size: ImageSize,
    pub batch_size: usize,
    /// Keep the backbone's dense top
    pub include_top: bool,
    pub epochs: usize,
    pub classes: usize,
    /// Pretrained backbone record; random init when absent
    #[serde(default)]
    pub weights: Option<PathBuf>,
    pub learning_rate: f64,
    #[serde(default)]
    pub architecture: BaseArchitecture,
    #[serde(default = "default_freeze_all")]
    pub freeze_all: bool,
    /// Number of trailing backbone layers left trainable when `FREEZE_ALL` is off
    #[serde(default)]
    pub freeze_till: Option<usize>,
    #[serde(default = "default_validation_split")]
    pub validation_split: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_freeze_all() -> bool {
    true
}

fn default_validation_split() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

impl Params {
    /// Validates the hyperparameters
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.batch_size == 0 {
            return Err("BATCH_SIZE must be > 0".to_string());
        }
        if self.epochs == 0 {
            return Err("EPOCHS must be > 0".to_string());
        }
        if self.classes == 0 {
            return Err("CLASSES must be > 0".to_string());
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err("LEARNING_RATE must be > 0".to_string());
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err("VALIDATION_SPLIT must be in [0, 1)".to_string());
        }
        Ok(())
    }

    pub fn freeze_policy(&self) -> FreezePolicy {
        FreezePolicy::from_params(self.freeze_all, self.freeze_till)
    }
}

// --------------------------------------------------------------------------------
// STAGE RECORDS
// --------------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataIngestionConfig {
    pub root_dir: PathBuf,
    pub source_url: String,
    pub local_data_file: PathBuf,
    pub unzip_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PrepareBaseModelConfig {
    pub root_dir: PathBuf,
    pub base_model_path: PathBuf,
    pub updated_base_model_path: PathBuf,
    pub params_image_size: ImageSize,
    pub params_learning_rate: f64,
    pub params_include_top: bool,
    pub params_weights: Option<PathBuf>,
    pub params_classes: usize,
    pub params_architecture: BaseArchitecture,
    pub params_freeze: FreezePolicy,
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub root_dir: PathBuf,
    pub trained_model_path: PathBuf,
    pub updated_base_model_path: PathBuf,
    pub training_data: PathBuf,
    pub params_epochs: usize,
    pub params_batch_size: usize,
    pub params_is_augmentation: bool,
    pub params_image_size: ImageSize,
    pub params_learning_rate: f64,
    pub params_validation_split: f64,
    pub params_seed: u64,
}

#[derive(Debug, Clone)]
pub struct EvaluationConfig {
    pub path_of_model: PathBuf,
    pub validation_data: PathBuf,
    pub mlflow_uri: String,
    /// Every entry of `params.yaml`, flattened, for the tracking run
    pub all_params: BTreeMap<String, String>,
    pub params_image_size: ImageSize,
    pub params_batch_size: usize,
    pub score_path: PathBuf,
    pub registered_model_name: String,
}

// --------------------------------------------------------------------------------
// MANAGER
// --------------------------------------------------------------------------------

/// Loads `config.yaml` and `params.yaml` and builds one record per stage.
#[derive(Debug, Clone)]
pub struct ConfigurationManager {
    config: ConfigFile,
    params: Params,
    all_params: BTreeMap<String, String>,
}

impl ConfigurationManager {
    pub fn new(config_path: &Path, params_path: &Path) -> Result<Self> {
        let config: ConfigFile = read_yaml(config_path)?;
        let raw_params: Value = read_yaml(params_path)?;
        let manager = Self::from_parts(config, raw_params)?;
        create_directories(&[&manager.config.artifacts_root], true)?;
        Ok(manager)
    }

    /// Builds a manager from already-parsed documents.
    pub fn from_parts(config: ConfigFile, raw_params: Value) -> Result<Self> {
        if !raw_params.is_mapping() {
            return Err(Error::Config(
                "params file must be a mapping of NAME: value".to_string(),
            ));
        }
        let params: Params = serde_yaml::from_value(raw_params.clone())
            .map_err(|e| Error::Config(format!("Invalid params: {e}")))?;
        params.validate().map_err(Error::Config)?;

        let all_params = flatten_params(&raw_params);
        debug!("Loaded {} params", all_params.len());

        Ok(Self {
            config,
            params,
            all_params,
        })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn get_data_ingestion_config(&self) -> Result<DataIngestionConfig> {
        let config = self.config.data_ingestion.clone();
        create_directories(&[&config.root_dir], true)?;
        Ok(config)
    }

    pub fn get_prepare_base_model_config(&self) -> Result<PrepareBaseModelConfig> {
        let section = &self.config.prepare_base_model;
        create_directories(&[&section.root_dir], true)?;

        Ok(PrepareBaseModelConfig {
            root_dir: section.root_dir.clone(),
            base_model_path: section.base_model_path.clone(),
            updated_base_model_path: section.updated_base_model_path.clone(),
            params_image_size: self.params.image_size,
            params_learning_rate: self.params.learning_rate,
            params_include_top: self.params.include_top,
            params_weights: self.params.weights.clone(),
            params_classes: self.params.classes,
            params_architecture: self.params.architecture,
            params_freeze: self.params.freeze_policy(),
        })
    }

    pub fn get_training_config(&self) -> Result<TrainingConfig> {
        let section = &self.config.training;
        create_directories(&[&section.root_dir], true)?;

        Ok(TrainingConfig {
            root_dir: section.root_dir.clone(),
            trained_model_path: section.trained_model_path.clone(),
            updated_base_model_path: self.config.prepare_base_model.updated_base_model_path.clone(),
            training_data: section.training_data.clone(),
            params_epochs: self.params.epochs,
            params_batch_size: self.params.batch_size,
            params_is_augmentation: self.params.augmentation,
            params_image_size: self.params.image_size,
            params_learning_rate: self.params.learning_rate,
            params_validation_split: self.params.validation_split,
            params_seed: self.params.seed,
        })
    }

    pub fn get_evaluation_config(&self) -> Result<EvaluationConfig> {
        let section = &self.config.evaluation;
        let mlflow_uri =
            resolve_tracking_uri(&section.mlflow_uri, std::env::var(TRACKING_URI_ENV).ok());

        Ok(EvaluationConfig {
            path_of_model: self.config.training.trained_model_path.clone(),
            validation_data: section.validation_data.clone(),
            mlflow_uri,
            all_params: self.all_params.clone(),
            params_image_size: self.params.image_size,
            params_batch_size: self.params.batch_size,
            score_path: section.score_path.clone(),
            registered_model_name: section.registered_model_name.clone(),
        })
    }
}

/// A non-empty environment value wins over the configured URI.
pub fn resolve_tracking_uri(configured: &str, env_value: Option<String>) -> String {
    env_value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| configured.to_string())
}

/// Flattens a YAML mapping into `key -> rendered value`.
///
/// Nested mappings produce dotted keys; sequences render as `[a, b, c]`.
pub fn flatten_params(value: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    flatten_into(None, value, &mut out);
    out
}

fn flatten_into(prefix: Option<&str>, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Mapping(map) => {
            for (key, nested) in map {
                let key = render_scalar(key);
                let key = match prefix {
                    Some(prefix) => format!("{prefix}.{key}"),
                    None => key,
                };
                flatten_into(Some(&key), nested, out);
            }
        }
        other => {
            if let Some(key) = prefix {
                out.insert(key.to_string(), render_scalar(other));
            }
        }
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Sequence(items) => {
            let items: Vec<String> = items.iter().map(render_scalar).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Mapping(_) => serde_yaml::to_string(value)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
        Value::Tagged(tagged) => render_scalar(&tagged.value),
    }
}
