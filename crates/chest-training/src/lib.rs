//! Model preparation, training and evaluation stages.
//!
//! - [`model`]: VGG-style backbone, dense top and classification head
//! - [`artifact`]: saving and loading models with their architecture
//! - [`base_model`]: stage 2, build the backbone and attach the head
//! - [`trainer`]: stage 3, fine-tune on the ingested images
//! - [`evaluator`]: stage 4, score the trained model and publish the run

pub mod artifact;
pub mod base_model;
pub mod evaluator;
pub mod metrics;
pub mod model;
pub mod trainer;

pub use artifact::{load_classifier, record_path, save_classifier, sidecar_path};
pub use base_model::PrepareBaseModel;
pub use evaluator::{evaluate_generator, Evaluation, PublishOutcome};
pub use metrics::{batch_stats, correct_predictions, EpochMetrics, Tally, TrainingHistory};
pub use model::{BaseModelConfig, ClassifierConfig, ClassifierModel, VggBackbone};
pub use trainer::Training;
