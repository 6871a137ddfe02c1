//! Loss/accuracy accumulation and per-epoch training history.

use std::path::Path;

use burn::{
    nn::loss::CrossEntropyLossConfig,
    prelude::*,
    tensor::ElementConversion,
};
use chest_core::{save_json, Result, Score};
use serde::{Deserialize, Serialize};

/// Number of rows whose arg-max matches the target class
pub fn correct_predictions<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size] = targets.dims();
    let predictions = logits.argmax(1).reshape([batch_size]);
    let correct: i64 = predictions.equal(targets).int().sum().into_scalar().elem();
    correct as usize
}

/// Mean cross-entropy loss and correct prediction count for one batch
pub fn batch_stats<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> (f64, usize) {
    let loss = CrossEntropyLossConfig::new()
        .init(&logits.device())
        .forward(logits.clone(), targets.clone());
    let loss: f64 = loss.into_scalar().elem();
    (loss, correct_predictions(logits, targets))
}

/// Sample-weighted running totals over a sequence of batches
#[derive(Debug, Clone, Copy, Default)]
pub struct Tally {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl Tally {
    /// Adds one batch whose mean loss is `loss`.
    pub fn add(&mut self, loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += loss * batch_size as f64;
        self.correct += correct;
        self.samples += batch_size;
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// `None` before any sample was added
    pub fn score(&self) -> Option<Score> {
        (self.samples > 0).then(|| Score {
            loss: self.loss_sum / self.samples as f64,
            accuracy: self.correct as f64 / self.samples as f64,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val_accuracy: Option<f64>,
}

impl EpochMetrics {
    pub fn new(epoch: usize, train: Score, validation: Option<Score>) -> Self {
        Self {
            epoch,
            loss: train.loss,
            accuracy: train.accuracy,
            val_loss: validation.map(|s| s.loss),
            val_accuracy: validation.map(|s| s.accuracy),
        }
    }
}

/// Metrics of every finished epoch, saved as `history.json` after training
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub steps_per_epoch: usize,
    pub validation_steps: usize,
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn new(steps_per_epoch: usize, validation_steps: usize) -> Self {
        Self {
            steps_per_epoch,
            validation_steps,
            epochs: Vec::new(),
        }
    }

    pub fn record(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    /// Epoch with the highest validation accuracy
    pub fn best_epoch(&self) -> Option<&EpochMetrics> {
        self.epochs
            .iter()
            .filter(|m| m.val_accuracy.is_some())
            .max_by(|a, b| {
                a.val_accuracy
                    .unwrap_or(0.0)
                    .total_cmp(&b.val_accuracy.unwrap_or(0.0))
            })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(path, self)
    }
}
