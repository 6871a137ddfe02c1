//! Batched image iteration and the burn batcher.
//!
//! An [`ImageGenerator`] walks an [`ImageFolder`] in batches. Every image is
//! resized to the model input with bilinear filtering and rescaled to
//! `[0, 1]`; training generators additionally shuffle each epoch and apply
//! random augmentation, both seeded so a run can be repeated.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use chest_core::{Error, ImageSize, Result};
use image::imageops::FilterType;
use image::{ImageReader, RgbImage};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::augmentation::{AugmentationConfig, Augmenter};
use crate::folder::{ImageFolder, Subset};

/// One preprocessed image ready for batching
#[derive(Clone, Debug)]
pub struct ImageItem {
    /// Flattened CHW values in `[0, 1]`
    pub image: Vec<f32>,
    pub label: usize,
    pub path: PathBuf,
}

impl ImageItem {
    /// Loads, resizes and rescales an image.
    pub fn from_path(path: &Path, label: usize, size: ImageSize) -> Result<Self> {
        let img = load_resized(path, size)?;
        Ok(Self::from_rgb(&img, label, path))
    }

    fn from_rgb(img: &RgbImage, label: usize, path: &Path) -> Self {
        let (width, height) = (img.width() as usize, img.height() as usize);
        let plane = height * width;
        let mut image = vec![0.0f32; 3 * plane];

        for (x, y, pixel) in img.enumerate_pixels() {
            let offset = y as usize * width + x as usize;
            image[offset] = pixel[0] as f32 / 255.0;
            image[plane + offset] = pixel[1] as f32 / 255.0;
            image[2 * plane + offset] = pixel[2] as f32 / 255.0;
        }

        Self {
            image,
            label,
            path: path.to_path_buf(),
        }
    }
}

fn load_resized(path: &Path, size: ImageSize) -> Result<RgbImage> {
    let img = ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|e| Error::Image(format!("{}: {e}", path.display())))?;
    Ok(img
        .resize_exact(size.width as u32, size.height as u32, FilterType::Triangle)
        .to_rgb8())
}

/// How a generator walks its folder
#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    pub image_size: ImageSize,
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    /// `None` disables augmentation
    pub augmentation: Option<AugmentationConfig>,
}

impl GeneratorConfig {
    /// Deterministic, non-shuffled and unaugmented iteration
    pub fn validation(image_size: ImageSize, batch_size: usize) -> Self {
        Self {
            image_size,
            batch_size,
            shuffle: false,
            seed: 0,
            augmentation: None,
        }
    }

    /// Shuffled iteration, augmented when `augment` is set
    pub fn training(image_size: ImageSize, batch_size: usize, augment: bool, seed: u64) -> Self {
        Self {
            image_size,
            batch_size,
            shuffle: true,
            seed,
            augmentation: augment.then(AugmentationConfig::default),
        }
    }
}

/// Batches of preprocessed images drawn from an [`ImageFolder`]
#[derive(Clone, Debug)]
pub struct ImageGenerator {
    folder: ImageFolder,
    config: GeneratorConfig,
    augmenter: Option<Augmenter>,
}

impl ImageGenerator {
    pub fn new(folder: ImageFolder, config: GeneratorConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::InvalidArgument("batch size must be > 0".to_string()));
        }
        let augmenter = config.augmentation.clone().map(Augmenter::new);
        Ok(Self {
            folder,
            config,
            augmenter,
        })
    }

    /// Scans `dir` and wraps the requested subset.
    pub fn flow_from_directory(
        dir: &Path,
        validation_split: f64,
        subset: Subset,
        config: GeneratorConfig,
    ) -> Result<Self> {
        let folder = ImageFolder::scan(dir, validation_split, subset)?;
        Self::new(folder, config)
    }

    pub fn samples(&self) -> usize {
        self.folder.len()
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    pub fn class_names(&self) -> &[String] {
        self.folder.class_names()
    }

    pub fn image_size(&self) -> ImageSize {
        self.config.image_size
    }

    /// Batches needed to cover every sample once, the last one possibly short
    pub fn num_batches(&self) -> usize {
        self.samples().div_ceil(self.config.batch_size)
    }

    /// Sample order for `epoch`: identity unless shuffling is on.
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.samples()).collect();
        if self.config.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Iterates the batches of one epoch. Loading errors end the epoch.
    pub fn epoch(&self, epoch: usize) -> EpochBatches<'_> {
        let augment_seed = self
            .config
            .seed
            .wrapping_mul(31)
            .wrapping_add(epoch as u64)
            .wrapping_add(1);
        EpochBatches {
            generator: self,
            order: self.epoch_order(epoch),
            position: 0,
            rng: ChaCha8Rng::seed_from_u64(augment_seed),
        }
    }

    fn load(&self, index: usize, rng: &mut ChaCha8Rng) -> Result<ImageItem> {
        let (path, label) = &self.folder.samples()[index];
        let img = load_resized(path, self.config.image_size)?;
        let img = match &self.augmenter {
            Some(augmenter) => augmenter.augment(&img, rng),
            None => img,
        };
        Ok(ImageItem::from_rgb(&img, *label, path))
    }
}

/// Iterator over the batches of one epoch
pub struct EpochBatches<'a> {
    generator: &'a ImageGenerator,
    order: Vec<usize>,
    position: usize,
    rng: ChaCha8Rng,
}

impl Iterator for EpochBatches<'_> {
    type Item = Result<Vec<ImageItem>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.generator.batch_size()).min(self.order.len());
        let indices = &self.order[self.position..end];
        self.position = end;

        let mut items = Vec::with_capacity(indices.len());
        for &index in indices {
            match self.generator.load(index, &mut self.rng) {
                Ok(item) => items.push(item),
                Err(e) => {
                    self.position = self.order.len();
                    return Some(Err(e));
                }
            }
        }
        Some(Ok(items))
    }
}

/// A batch of images and their class indices
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// Images with shape `[batch_size, 3, height, width]`
    pub images: Tensor<B, 4>,
    /// Labels with shape `[batch_size]`
    pub targets: Tensor<B, 1, Int>,
}

/// Stacks [`ImageItem`]s into an [`ImageBatch`]
#[derive(Clone, Debug)]
pub struct ImageBatcher<B: Backend> {
    image_size: ImageSize,
    _backend: PhantomData<B>,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(image_size: ImageSize) -> Self {
        Self {
            image_size,
            _backend: PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let ImageSize {
            height,
            width,
            channels,
        } = self.image_size;

        let images_data: Vec<f32> = items.iter().flat_map(|item| item.image.iter().copied()).collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, channels, height, width]),
            device,
        );

        let targets_data: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        ImageBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::Rgb;
    use std::fs;
    use tempfile::tempdir;

    type TestBackend = NdArray;

    fn write_dataset(root: &Path, per_class: usize) {
        for (class, shade) in [("Coccidiosis", 40u8), ("Healthy", 220u8)] {
            let dir = root.join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                let img = RgbImage::from_fn(12, 10, |x, _| Rgb([shade, (x * 10) as u8, i as u8]));
                img.save(dir.join(format!("{i}.png"))).unwrap();
            }
        }
    }

    #[test]
    fn test_item_is_rescaled_chw() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("white.png");
        RgbImage::from_pixel(5, 7, Rgb([255, 0, 51])).save(&path).unwrap();

        let item = ImageItem::from_path(&path, 1, ImageSize::new(4, 6))?;
        assert_eq!(item.image.len(), 3 * 4 * 6);
        let plane = 4 * 6;
        assert!(item.image[..plane].iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(item.image[plane..2 * plane].iter().all(|v| *v == 0.0));
        assert!(item.image[2 * plane..].iter().all(|v| (*v - 0.2).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_corrupt_image_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.png");
        fs::write(&path, b"definitely not a png").unwrap();
        assert!(ImageItem::from_path(&path, 0, ImageSize::new(4, 4)).is_err());
    }

    #[test]
    fn test_validation_generator_is_deterministic() -> Result<()> {
        let dir = tempdir().unwrap();
        write_dataset(dir.path(), 3);
        let config = GeneratorConfig::validation(ImageSize::new(8, 8), 4);
        let generator = ImageGenerator::flow_from_directory(dir.path(), 0.0, Subset::All, config)?;

        assert_eq!(generator.samples(), 6);
        assert_eq!(generator.num_batches(), 2);

        let first: Vec<Vec<ImageItem>> = generator.epoch(0).collect::<Result<_>>()?;
        let second: Vec<Vec<ImageItem>> = generator.epoch(5).collect::<Result<_>>()?;
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].len(), 2);

        let labels: Vec<usize> = first.iter().flatten().map(|i| i.label).collect();
        assert_eq!(labels, vec![0, 0, 0, 1, 1, 1]);
        for (a, b) in first.iter().flatten().zip(second.iter().flatten()) {
            assert_eq!(a.path, b.path);
            assert_eq!(a.image, b.image);
        }
        Ok(())
    }

    #[test]
    fn test_training_generator_shuffles_per_epoch() -> Result<()> {
        let dir = tempdir().unwrap();
        write_dataset(dir.path(), 8);
        let config = GeneratorConfig::training(ImageSize::new(8, 8), 4, true, 42);
        let generator = ImageGenerator::flow_from_directory(dir.path(), 0.0, Subset::All, config)?;

        let epoch0 = generator.epoch_order(0);
        assert_eq!(epoch0, generator.epoch_order(0));
        assert_ne!(epoch0, generator.epoch_order(1));

        let mut sorted = epoch0.clone();
        sorted.sort();
        assert_eq!(sorted, (0..16).collect::<Vec<_>>());

        let batches: Vec<Vec<ImageItem>> = generator.epoch(0).collect::<Result<_>>()?;
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 16);
        Ok(())
    }

    #[test]
    fn test_batcher_shapes() -> Result<()> {
        let dir = tempdir().unwrap();
        write_dataset(dir.path(), 2);
        let size = ImageSize::new(8, 6);
        let config = GeneratorConfig::validation(size, 3);
        let generator = ImageGenerator::flow_from_directory(dir.path(), 0.0, Subset::All, config)?;
        let items = generator.epoch(0).next().unwrap()?;

        let device = <TestBackend as Backend>::Device::default();
        let batch = ImageBatcher::<TestBackend>::new(size).batch(items, &device);
        assert_eq!(batch.images.dims(), [3, 3, 8, 6]);
        assert_eq!(batch.targets.dims(), [3]);
        Ok(())
    }
}
