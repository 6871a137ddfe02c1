//! Dataset handling for the chest disease classifier.
//!
//! - [`ingestion`]: download and extract the image archive
//! - [`folder`]: class-per-directory scanning with a validation split
//! - [`augmentation`]: random affine transforms for training images
//! - [`generator`]: batched iteration and the burn batcher

pub mod augmentation;
pub mod folder;
pub mod generator;
pub mod ingestion;

pub use augmentation::{AugmentationConfig, Augmenter};
pub use folder::{ImageFolder, Subset, IMAGE_EXTENSIONS};
pub use generator::{GeneratorConfig, ImageBatch, ImageBatcher, ImageGenerator, ImageItem};
pub use ingestion::{DataIngestion, DownloadOutcome};
