//! Training stage: fine-tune the updated base model on the ingested images.

use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{GradientsParams, Optimizer, SgdConfig},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use chest_core::{Error, Result, TrainingConfig};
use chest_dataset::{GeneratorConfig, ImageBatcher, ImageGenerator, Subset};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::artifact::{load_classifier, save_classifier};
use crate::evaluator::evaluate_generator;
use crate::metrics::{correct_predictions, EpochMetrics, Tally, TrainingHistory};
use crate::model::{ClassifierConfig, ClassifierModel};

const HISTORY_FILE: &str = "history.json";

pub struct Training {
    config: TrainingConfig,
}

impl Training {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    /// Loads the updated base model written by the prepare stage.
    pub fn get_base_model<B: AutodiffBackend>(
        &self,
        device: &B::Device,
    ) -> Result<(ClassifierModel<B>, ClassifierConfig)> {
        load_classifier::<B>(&self.config.updated_base_model_path, device)
    }

    /// Training and validation generators over `training_data`.
    ///
    /// The validation subset is never shuffled nor augmented. The training
    /// subset is shuffled and augmented when `AUGMENTATION` is on.
    pub fn train_valid_generator(&self) -> Result<(ImageGenerator, ImageGenerator)> {
        let size = self.config.params_image_size;
        let batch_size = self.config.params_batch_size;
        let split = self.config.params_validation_split;

        let valid = ImageGenerator::flow_from_directory(
            &self.config.training_data,
            split,
            Subset::Validation,
            GeneratorConfig::validation(size, batch_size),
        )?;
        let train = ImageGenerator::flow_from_directory(
            &self.config.training_data,
            split,
            Subset::Training,
            GeneratorConfig::training(
                size,
                batch_size,
                self.config.params_is_augmentation,
                self.config.params_seed,
            ),
        )?;

        info!(
            "Found {} training and {} validation images in {} classes ({})",
            train.samples(),
            valid.samples(),
            train.class_names().len(),
            train.class_names().join(", ")
        );
        Ok((train, valid))
    }

    /// Runs SGD for `EPOCHS` epochs and saves the model to `trained_model_path`.
    pub fn train<B: AutodiffBackend>(&self, device: &B::Device) -> Result<TrainingHistory> {
        let (mut model, model_config) = self.get_base_model::<B>(device)?;
        let (train, valid) = self.train_valid_generator()?;

        if train.class_names().len() != model_config.num_classes {
            return Err(Error::Dataset(format!(
                "model predicts {} classes but {} has {}",
                model_config.num_classes,
                self.config.training_data.display(),
                train.class_names().len()
            )));
        }
        if train.samples() == 0 {
            return Err(Error::Dataset(format!(
                "no training images in {}",
                self.config.training_data.display()
            )));
        }

        let steps_per_epoch = (train.samples() / train.batch_size()).max(1);
        let validation_steps = if valid.samples() == 0 {
            warn!("Validation subset is empty, skipping validation");
            0
        } else {
            (valid.samples() / valid.batch_size()).max(1)
        };
        info!(
            "Training for {} epochs: {} steps per epoch, {} validation steps, lr {}",
            self.config.params_epochs,
            steps_per_epoch,
            validation_steps,
            self.config.params_learning_rate
        );

        let mut optimizer = SgdConfig::new().init();
        let batcher = ImageBatcher::<B>::new(train.image_size());
        let mut history = TrainingHistory::new(steps_per_epoch, validation_steps);

        for epoch in 0..self.config.params_epochs {
            let progress = ProgressBar::new(steps_per_epoch as u64);
            progress.set_style(
                ProgressStyle::default_bar()
                    .template("Epoch {msg} [{bar:30}] {pos}/{len}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            progress.set_message(format!("{}/{}", epoch + 1, self.config.params_epochs));

            let mut tally = Tally::default();
            for items in train.epoch(epoch).take(steps_per_epoch) {
                let items = items?;
                let batch_size = items.len();
                let batch = batcher.batch(items, device);

                let logits = model.forward(batch.images);
                let loss = CrossEntropyLossConfig::new()
                    .init(&logits.device())
                    .forward(logits.clone(), batch.targets.clone());
                let loss_value: f64 = loss.clone().into_scalar().elem();
                let correct = correct_predictions(logits.detach(), batch.targets);
                tally.add(loss_value, correct, batch_size);

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optimizer.step(self.config.params_learning_rate, model, grads);
                progress.inc(1);
            }
            progress.finish_and_clear();

            let train_score = tally.score().ok_or_else(|| {
                Error::Training(format!("epoch {} produced no batches", epoch + 1))
            })?;
            let valid_score = if validation_steps > 0 {
                let valid_model = model.valid();
                Some(evaluate_generator(&valid_model, &valid, validation_steps, device)?)
            } else {
                None
            };

            let metrics = EpochMetrics::new(epoch + 1, train_score, valid_score);
            match valid_score {
                Some(v) => info!(
                    "Epoch {}/{}: loss {:.4} - accuracy {:.4} - val_loss {:.4} - val_accuracy {:.4}",
                    epoch + 1,
                    self.config.params_epochs,
                    train_score.loss,
                    train_score.accuracy,
                    v.loss,
                    v.accuracy
                ),
                None => info!(
                    "Epoch {}/{}: loss {:.4} - accuracy {:.4}",
                    epoch + 1,
                    self.config.params_epochs,
                    train_score.loss,
                    train_score.accuracy
                ),
            }
            if !train_score.is_finite() {
                return Err(Error::Training(format!(
                    "loss diverged at epoch {} ({})",
                    epoch + 1,
                    train_score.loss
                )));
            }
            history.record(metrics);
        }

        save_classifier(&model, &model_config, &self.config.trained_model_path)?;
        history.save(&self.config.root_dir.join(HISTORY_FILE))?;
        Ok(history)
    }
}
