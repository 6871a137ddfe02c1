//! Model persistence.
//!
//! A saved model is two files: the weight record written by burn's
//! `CompactRecorder` (`<name>.mpk`) and the architecture config next to it
//! (`<name>.json`). The config is enough to rebuild the module before the
//! record is loaded into it.

use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    config::Config,
    module::Module,
    record::CompactRecorder,
    tensor::backend::Backend,
};
use chest_core::{Error, Result};
use tracing::info;

use crate::model::{BaseModelConfig, ClassifierConfig, ClassifierModel, VggBackbone};

/// Path of the architecture config saved next to `model_path`
pub fn sidecar_path(model_path: &Path) -> PathBuf {
    model_path.with_extension("json")
}

/// Path of the weight record for `model_path`; the recorder always writes `.mpk`
pub fn record_path(model_path: &Path) -> PathBuf {
    model_path.with_extension("mpk")
}

fn save_module<B: Backend, M: Module<B>>(module: M, model_path: &Path) -> Result<()> {
    if let Some(parent) = model_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    module
        .save_file(record_path(model_path), &CompactRecorder::new())
        .map_err(|e| Error::Model(format!("Failed to save {}: {e:?}", model_path.display())))
}

fn load_module<B: Backend, M: Module<B>>(module: M, model_path: &Path, device: &B::Device) -> Result<M> {
    module
        .load_file(record_path(model_path), &CompactRecorder::new(), device)
        .map_err(|e| Error::Model(format!("Failed to load {}: {e:?}", model_path.display())))
}

fn save_config<C: Config>(config: &C, model_path: &Path) -> Result<()> {
    let path = sidecar_path(model_path);
    config
        .save(&path)
        .map_err(|e| Error::Model(format!("Failed to save {}: {e}", path.display())))
}

fn load_config<C: Config>(model_path: &Path) -> Result<C> {
    let path = sidecar_path(model_path);
    if !path.is_file() {
        return Err(Error::NotFound(format!(
            "model config {} (expected next to the weights)",
            path.display()
        )));
    }
    C::load(&path).map_err(|e| Error::Model(format!("Invalid model config {}: {e:?}", path.display())))
}

fn ensure_record(model_path: &Path) -> Result<()> {
    let record = record_path(model_path);
    if !record.is_file() {
        return Err(Error::NotFound(format!("model {}", record.display())));
    }
    Ok(())
}

/// Saves a backbone and its architecture.
pub fn save_backbone<B: Backend>(
    backbone: &VggBackbone<B>,
    config: &BaseModelConfig,
    model_path: &Path,
) -> Result<()> {
    save_module(backbone.clone(), model_path)?;
    save_config(config, model_path)?;
    info!("Saved base model to {}", record_path(model_path).display());
    Ok(())
}

/// Loads weights for an already-built backbone, e.g. pretrained ImageNet weights.
pub fn load_backbone_weights<B: Backend>(
    backbone: VggBackbone<B>,
    weights_path: &Path,
    device: &B::Device,
) -> Result<VggBackbone<B>> {
    ensure_record(weights_path)?;
    load_module(backbone, weights_path, device)
}

/// Saves a classifier and its architecture.
pub fn save_classifier<B: Backend>(
    model: &ClassifierModel<B>,
    config: &ClassifierConfig,
    model_path: &Path,
) -> Result<()> {
    save_module(model.clone(), model_path)?;
    save_config(config, model_path)?;
    info!("Saved model to {}", record_path(model_path).display());
    Ok(())
}

/// Rebuilds a classifier from its config and loads its weights.
/// The freeze policy stored in the config is applied again.
pub fn load_classifier<B: Backend>(
    model_path: &Path,
    device: &B::Device,
) -> Result<(ClassifierModel<B>, ClassifierConfig)> {
    ensure_record(model_path)?;
    let config: ClassifierConfig = load_config(model_path)?;
    config.validate()?;

    let model = load_module(config.init::<B>(device), model_path, device)?;
    let model = model.freeze(config.freeze);
    info!(
        "Loaded {} classifier ({} classes) from {}",
        config.base.architecture,
        config.num_classes,
        record_path(model_path).display()
    );
    Ok((model, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;
    use chest_core::{BaseArchitecture, FreezePolicy, ImageSize};
    use tempfile::tempdir;

    type TestBackend = NdArray;

    fn classifier_config() -> ClassifierConfig {
        let base = BaseModelConfig::new(BaseArchitecture::Compact, ImageSize::new(16, 16));
        ClassifierConfig::new(base, 3, FreezePolicy::All)
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("artifacts/training/model.mpk")),
            PathBuf::from("artifacts/training/model.json")
        );
    }

    #[test]
    fn test_classifier_save_load_keeps_predictions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/model.mpk");
        let device = Default::default();
        let config = classifier_config();
        let model = config.init::<TestBackend>(&device);

        save_classifier(&model, &config, &path).unwrap();
        assert!(path.is_file());
        assert!(sidecar_path(&path).is_file());

        let (loaded, loaded_config) = load_classifier::<TestBackend>(&path, &device).unwrap();
        assert_eq!(loaded_config.num_classes, 3);
        assert_eq!(loaded_config.freeze, FreezePolicy::All);

        let input = Tensor::<TestBackend, 4>::ones([1, 3, 16, 16], &device);
        let before: Vec<f32> = model.predict(input.clone()).into_data().to_vec().unwrap();
        let after: Vec<f32> = loaded.predict(input).into_data().to_vec().unwrap();
        for (a, b) in before.iter().zip(after.iter()) {
            // the compact recorder stores half precision
            assert!((a - b).abs() < 1e-2);
        }
    }

    #[test]
    fn test_missing_model_is_not_found() {
        let dir = tempdir().unwrap();
        let device = Default::default();
        let result = load_classifier::<TestBackend>(&dir.path().join("absent.mpk"), &device);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_missing_sidecar_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.mpk");
        let device = Default::default();
        let config = classifier_config();
        save_classifier(&config.init::<TestBackend>(&device), &config, &path).unwrap();
        fs::remove_file(sidecar_path(&path)).unwrap();

        let result = load_classifier::<TestBackend>(&path, &device);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
