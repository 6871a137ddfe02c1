//! Prepare-base-model stage.

use burn::{module::Module, tensor::backend::Backend};
use chest_core::{Error, PrepareBaseModelConfig, Result};
use tracing::{info, warn};

use crate::artifact::{load_backbone_weights, save_backbone, save_classifier};
use crate::model::{BaseModelConfig, ClassifierConfig, ClassifierModel, VggBackbone};

pub struct PrepareBaseModel {
    config: PrepareBaseModelConfig,
}

impl PrepareBaseModel {
    pub fn new(config: PrepareBaseModelConfig) -> Self {
        Self { config }
    }

    pub fn base_model_config(&self) -> BaseModelConfig {
        BaseModelConfig::new(self.config.params_architecture, self.config.params_image_size)
            .with_include_top(self.config.params_include_top)
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig::new(
            self.base_model_config(),
            self.config.params_classes,
            self.config.params_freeze,
        )
    }

    /// Builds the backbone, loads `WEIGHTS` when configured and saves it to
    /// `base_model_path`.
    pub fn get_base_model<B: Backend>(&self, device: &B::Device) -> Result<VggBackbone<B>> {
        let config = self.base_model_config();
        config.validate()?;

        let backbone = config.init::<B>(device);
        let backbone = match &self.config.params_weights {
            Some(weights) => {
                info!("Loading base model weights from {}", weights.display());
                load_backbone_weights(backbone, weights, device)?
            }
            None => {
                warn!(
                    "No WEIGHTS configured, {} base model starts from random initialization",
                    config.architecture
                );
                backbone
            }
        };

        info!(
            "Base model: {} ({} layers, include_top={}, {} parameters)",
            config.architecture,
            backbone.num_layers(),
            config.include_top,
            backbone.num_params()
        );
        save_backbone(&backbone, &config, &self.config.base_model_path)?;
        Ok(backbone)
    }

    /// Freezes the backbone, attaches the classification head and saves the
    /// result to `updated_base_model_path`.
    pub fn update_base_model<B: Backend>(
        &self,
        backbone: VggBackbone<B>,
        device: &B::Device,
    ) -> Result<ClassifierModel<B>> {
        let config = self.classifier_config();
        config.validate()?;
        if self.config.params_learning_rate.is_nan() || self.config.params_learning_rate <= 0.0 {
            return Err(Error::Config(format!(
                "learning rate must be > 0, got {}",
                self.config.params_learning_rate
            )));
        }

        let model = config.attach_head(backbone, device);
        info!(
            "Updated model: {} classes, freeze {}, {} parameters, SGD lr={}",
            config.num_classes,
            config.freeze,
            model.num_params(),
            self.config.params_learning_rate
        );
        save_classifier(&model, &config, &self.config.updated_base_model_path)?;
        Ok(model)
    }

    /// Runs both steps.
    pub fn run<B: Backend>(&self, device: &B::Device) -> Result<ClassifierModel<B>> {
        let backbone = self.get_base_model::<B>(device)?;
        self.update_base_model(backbone, device)
    }
}
