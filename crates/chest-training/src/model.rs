//! Model architecture: a VGG-style convolutional backbone with an optional
//! ImageNet dense top, followed by a flatten + dense classification head.
//!
//! ```text
//! input [N, 3, H, W]
//!   └─ blocks: (conv3x3 + ReLU) x k, maxpool 2x2   ← backbone
//!   └─ flatten
//!   └─ top (optional): 4096 → 4096 → 1000 softmax  ← backbone
//!   └─ head: dense(num_classes)                    ← trained
//! ```

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
    tensor::activation::softmax,
};
use chest_core::{BaseArchitecture, Error, FreezePolicy, ImageSize};

/// Output width of the ImageNet dense top
pub const IMAGENET_CLASSES: usize = 1000;
const TOP_UNITS: usize = 4096;

/// Architecture of the backbone, saved next to every backbone record
#[derive(Config, Debug)]
pub struct BaseModelConfig {
    pub architecture: BaseArchitecture,
    pub image_size: ImageSize,
    /// Keep the dense top (fc 4096 → fc 4096 → 1000 softmax)
    #[config(default = false)]
    pub include_top: bool,
}

impl BaseModelConfig {
    /// `(channels, height, width)` of the last pooled feature map
    pub fn feature_map(&self) -> (usize, usize, usize) {
        let blocks = self.architecture.blocks();
        let channels = blocks.last().map(|(c, _)| *c).unwrap_or(3);
        let (mut h, mut w) = (self.image_size.height, self.image_size.width);
        for _ in blocks {
            h /= 2;
            w /= 2;
        }
        (channels, h, w)
    }

    /// Width of the flattened backbone output
    pub fn output_features(&self) -> usize {
        if self.include_top {
            IMAGENET_CLASSES
        } else {
            let (c, h, w) = self.feature_map();
            c * h * w
        }
    }

    pub fn validate(&self) -> chest_core::Result<()> {
        let (_, h, w) = self.feature_map();
        if h == 0 || w == 0 {
            return Err(Error::Model(format!(
                "image size {} is too small for {} ({} pooling stages)",
                self.image_size,
                self.architecture,
                self.architecture.blocks().len()
            )));
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> VggBackbone<B> {
        let mut in_channels = self.image_size.channels;
        let blocks = self
            .architecture
            .blocks()
            .iter()
            .map(|&(out_channels, layers)| {
                let block = ConvBlock::new(in_channels, out_channels, layers, device);
                in_channels = out_channels;
                block
            })
            .collect();

        let top = self.include_top.then(|| {
            let (c, h, w) = self.feature_map();
            DenseTop::new(c * h * w, device)
        });

        VggBackbone { blocks, top }
    }
}

/// Conv layers sharing one output width, followed by 2x2 max pooling
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    fn new(in_channels: usize, out_channels: usize, layers: usize, device: &B::Device) -> Self {
        let convs = (0..layers)
            .map(|i| {
                let input = if i == 0 { in_channels } else { out_channels };
                Conv2dConfig::new([input, out_channels], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device)
            })
            .collect();

        Self {
            convs,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            activation: Relu::new(),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input;
        for conv in &self.convs {
            x = self.activation.forward(conv.forward(x));
        }
        self.pool.forward(x)
    }

    fn freeze_layers(mut self, index: &mut usize, frozen: usize) -> Self {
        self.convs = self
            .convs
            .into_iter()
            .map(|conv| freeze_if(conv, index, frozen))
            .collect();
        self
    }
}

/// ImageNet classifier top kept when `include_top` is set
#[derive(Module, Debug)]
pub struct DenseTop<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    predictions: Linear<B>,
    activation: Relu,
}

impl<B: Backend> DenseTop<B> {
    fn new(in_features: usize, device: &B::Device) -> Self {
        Self {
            fc1: LinearConfig::new(in_features, TOP_UNITS).init(device),
            fc2: LinearConfig::new(TOP_UNITS, TOP_UNITS).init(device),
            predictions: LinearConfig::new(TOP_UNITS, IMAGENET_CLASSES).init(device),
            activation: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.activation.forward(self.fc1.forward(x));
        let x = self.activation.forward(self.fc2.forward(x));
        softmax(self.predictions.forward(x), 1)
    }

    fn freeze_layers(self, index: &mut usize, frozen: usize) -> Self {
        Self {
            fc1: freeze_if(self.fc1, index, frozen),
            fc2: freeze_if(self.fc2, index, frozen),
            predictions: freeze_if(self.predictions, index, frozen),
            activation: self.activation,
        }
    }
}

fn freeze_if<B: Backend, M: Module<B>>(layer: M, index: &mut usize, frozen: usize) -> M {
    let freeze = *index < frozen;
    *index += 1;
    if freeze {
        layer.no_grad()
    } else {
        layer
    }
}

/// Convolutional backbone, the "base model"
#[derive(Module, Debug)]
pub struct VggBackbone<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    top: Option<DenseTop<B>>,
}

impl<B: Backend> VggBackbone<B> {
    /// Returns flattened features `[N, output_features]`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = input;
        for block in &self.blocks {
            x = block.forward(x);
        }
        let [batch, channels, height, width] = x.dims();
        let x = x.reshape([batch, channels * height * width]);
        match &self.top {
            Some(top) => top.forward(x),
            None => x,
        }
    }

    /// Conv layers plus dense top layers, in forward order
    pub fn num_layers(&self) -> usize {
        let convs: usize = self.blocks.iter().map(|b| b.convs.len()).sum();
        convs + if self.top.is_some() { 3 } else { 0 }
    }

    /// Stops gradient flow into the leading layers selected by `policy`.
    pub fn freeze(self, policy: FreezePolicy) -> Self {
        let frozen = policy.frozen_layers(self.num_layers());
        let mut index = 0;
        let blocks = self
            .blocks
            .into_iter()
            .map(|block| block.freeze_layers(&mut index, frozen))
            .collect();
        let top = self.top.map(|top| top.freeze_layers(&mut index, frozen));
        Self { blocks, top }
    }
}

/// Architecture of the full classifier, saved next to every classifier record
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    pub base: BaseModelConfig,
    pub num_classes: usize,
    pub freeze: FreezePolicy,
}

impl ClassifierConfig {
    pub fn validate(&self) -> chest_core::Result<()> {
        if self.num_classes == 0 {
            return Err(Error::Model("number of classes must be > 0".to_string()));
        }
        self.base.validate()
    }

    /// Randomly initialized classifier with the freeze policy applied
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassifierModel<B> {
        self.attach_head(self.base.init(device), device)
    }

    /// Adds a fresh head to `base` and applies the freeze policy.
    pub fn attach_head<B: Backend>(&self, base: VggBackbone<B>, device: &B::Device) -> ClassifierModel<B> {
        ClassifierModel {
            base: base.freeze(self.freeze),
            head: LinearConfig::new(self.base.output_features(), self.num_classes).init(device),
        }
    }
}

/// Backbone plus classification head
#[derive(Module, Debug)]
pub struct ClassifierModel<B: Backend> {
    base: VggBackbone<B>,
    head: Linear<B>,
}

impl<B: Backend> ClassifierModel<B> {
    /// Class logits `[N, num_classes]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.base.forward(images))
    }

    /// Class probabilities
    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    pub fn base(&self) -> &VggBackbone<B> {
        &self.base
    }

    pub fn freeze(self, policy: FreezePolicy) -> Self {
        Self {
            base: self.base.freeze(policy),
            head: self.head,
        }
    }
}
