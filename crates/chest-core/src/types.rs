//! Shared value types for the pipeline stages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Model input dimensions, written as `[height, width, channels]` in params.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct ImageSize {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageSize {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            channels: 3,
        }
    }

    /// VGG16 / ImageNet input size (224x224x3)
    pub fn imagenet() -> Self {
        Self::new(224, 224)
    }

    /// Number of values in one CHW image tensor
    pub fn num_values(&self) -> usize {
        self.height * self.width * self.channels
    }
}

impl TryFrom<Vec<usize>> for ImageSize {
    type Error = String;

    fn try_from(dims: Vec<usize>) -> std::result::Result<Self, Self::Error> {
        match dims.as_slice() {
            [height, width, _] if *height == 0 || *width == 0 => Err(format!(
                "IMAGE_SIZE height and width must be > 0, got {height}x{width}"
            )),
            [height, width, 3] => Ok(Self::new(*height, *width)),
            [_, _, channels] => Err(format!(
                "IMAGE_SIZE must have 3 channels, got {channels}"
            )),
            other => Err(format!(
                "IMAGE_SIZE must be [height, width, channels], got {other:?}"
            )),
        }
    }
}

impl From<ImageSize> for Vec<usize> {
    fn from(size: ImageSize) -> Self {
        vec![size.height, size.width, size.channels]
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// Convolutional backbone used as the base model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BaseArchitecture {
    /// 13 conv layers in 5 pooled blocks
    #[default]
    Vgg16,
    /// 3 single-conv blocks, for small inputs and quick experiments
    Compact,
}

impl BaseArchitecture {
    /// `(out_channels, conv_layers)` for each pooled block.
    pub fn blocks(&self) -> &'static [(usize, usize)] {
        match self {
            BaseArchitecture::Vgg16 => &[(64, 2), (128, 2), (256, 3), (512, 3), (512, 3)],
            BaseArchitecture::Compact => &[(16, 1), (32, 1), (64, 1)],
        }
    }

    pub fn num_conv_layers(&self) -> usize {
        self.blocks().iter().map(|(_, layers)| layers).sum()
    }
}

impl fmt::Display for BaseArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseArchitecture::Vgg16 => write!(f, "VGG16"),
            BaseArchitecture::Compact => write!(f, "Compact"),
        }
    }
}

/// Which backbone layers stay frozen during fine-tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "trainable_layers", rename_all = "snake_case")]
pub enum FreezePolicy {
    /// Every backbone layer is frozen; only the head trains
    All,
    /// All but the last `n` conv layers are frozen
    AllButLast(usize),
    /// Nothing is frozen
    None,
}

impl FreezePolicy {
    /// Builds the policy from the `FREEZE_ALL` / `FREEZE_TILL` params.
    pub fn from_params(freeze_all: bool, freeze_till: Option<usize>) -> Self {
        match (freeze_all, freeze_till) {
            (true, _) => FreezePolicy::All,
            (false, Some(n)) => FreezePolicy::AllButLast(n),
            (false, None) => FreezePolicy::None,
        }
    }

    /// Number of leading conv layers to freeze out of `total`.
    pub fn frozen_layers(&self, total: usize) -> usize {
        match self {
            FreezePolicy::All => total,
            FreezePolicy::AllButLast(n) => total.saturating_sub(*n),
            FreezePolicy::None => 0,
        }
    }
}

impl fmt::Display for FreezePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreezePolicy::All => write!(f, "freeze all"),
            FreezePolicy::AllButLast(n) => write!(f, "train last {n} layers"),
            FreezePolicy::None => write!(f, "fully trainable"),
        }
    }
}

/// Evaluation score persisted to `scores.json`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub loss: f64,
    pub accuracy: f64,
}

impl Score {
    pub fn is_finite(&self) -> bool {
        self.loss.is_finite() && self.accuracy.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_size_from_params() {
        let size: ImageSize = serde_yaml::from_str("[224, 224, 3]").unwrap();
        assert_eq!(size, ImageSize::imagenet());
        assert_eq!(size.num_values(), 224 * 224 * 3);
    }

    #[test]
    fn test_image_size_rejects_grayscale() {
        let result: std::result::Result<ImageSize, _> = serde_yaml::from_str("[224, 224, 1]");
        assert!(result.is_err());
    }

    #[test]
    fn test_image_size_rejects_zero_dimension() {
        let err = serde_yaml::from_str::<ImageSize>("[0, 224, 3]").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("height and width must be > 0"), "{message}");
        assert!(!message.contains("channels"), "{message}");
    }

    #[test]
    fn test_freeze_policy() {
        assert_eq!(FreezePolicy::from_params(true, Some(3)), FreezePolicy::All);
        assert_eq!(FreezePolicy::All.frozen_layers(13), 13);
        assert_eq!(FreezePolicy::AllButLast(3).frozen_layers(13), 10);
        assert_eq!(FreezePolicy::AllButLast(20).frozen_layers(13), 0);
        assert_eq!(FreezePolicy::from_params(false, None).frozen_layers(13), 0);
    }

    #[test]
    fn test_architecture_layers() {
        assert_eq!(BaseArchitecture::Vgg16.num_conv_layers(), 13);
        assert_eq!(BaseArchitecture::Compact.num_conv_layers(), 3);
    }
}
