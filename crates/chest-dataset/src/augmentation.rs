//! Random affine augmentation for training images.
//!
//! Each image gets one combined transform: rotation, shear and zoom about the
//! image centre, then a translation, then an optional horizontal flip.
//! Pixels that fall outside the source are filled with the nearest edge
//! pixel. Validation and evaluation images are never augmented.

use image::{Rgb, RgbImage};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Configuration for data augmentation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AugmentationConfig {
    /// Maximum rotation in degrees (applies ±rotation_range)
    pub rotation_range: f32,
    /// Horizontal shift as a fraction of the width
    pub width_shift_range: f32,
    /// Vertical shift as a fraction of the height
    pub height_shift_range: f32,
    /// Maximum shear angle in degrees
    pub shear_range: f32,
    /// Zoom factor drawn from `[1 - zoom_range, 1 + zoom_range]` per axis
    pub zoom_range: f32,
    /// Flip half of the images left to right
    pub horizontal_flip: bool,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rotation_range: 40.0,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            shear_range: 0.2,
            zoom_range: 0.2,
            horizontal_flip: true,
        }
    }
}

impl AugmentationConfig {
    /// Identity transform
    pub fn none() -> Self {
        Self {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            shear_range: 0.0,
            zoom_range: 0.0,
            horizontal_flip: false,
        }
    }
}

/// One sampled transform
#[derive(Clone, Copy, Debug, PartialEq)]
struct AffineParams {
    theta: f32,
    shift_x: f32,
    shift_y: f32,
    shear: f32,
    zoom_x: f32,
    zoom_y: f32,
    flip: bool,
}

/// Image augmenter that applies random transformations
#[derive(Clone, Debug)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// Applies one random transform to `img`. Output has the same dimensions.
    pub fn augment(&self, img: &RgbImage, rng: &mut ChaCha8Rng) -> RgbImage {
        let params = self.sample(img.width(), img.height(), rng);
        let mut output = warp(img, &params);
        if params.flip {
            image::imageops::flip_horizontal_in_place(&mut output);
        }
        output
    }

    fn sample(&self, width: u32, height: u32, rng: &mut ChaCha8Rng) -> AffineParams {
        let c = &self.config;
        AffineParams {
            theta: symmetric(rng, c.rotation_range).to_radians(),
            shift_x: symmetric(rng, c.width_shift_range) * width as f32,
            shift_y: symmetric(rng, c.height_shift_range) * height as f32,
            shear: symmetric(rng, c.shear_range).to_radians(),
            zoom_x: 1.0 + symmetric(rng, c.zoom_range),
            zoom_y: 1.0 + symmetric(rng, c.zoom_range),
            flip: c.horizontal_flip && rng.gen_bool(0.5),
        }
    }
}

fn symmetric(rng: &mut ChaCha8Rng, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

/// Maps every output pixel back into the source with
/// `src = R(theta) * Shear * Zoom * (dst - centre) + centre + shift`.
fn warp(img: &RgbImage, p: &AffineParams) -> RgbImage {
    let (width, height) = img.dimensions();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    let (sin_t, cos_t) = p.theta.sin_cos();
    let (sin_s, cos_s) = p.shear.sin_cos();

    // R * S, then scaled column-wise by the zoom
    let a = cos_t * p.zoom_x;
    let b = (-cos_t * sin_s - sin_t * cos_s) * p.zoom_y;
    let c = sin_t * p.zoom_x;
    let d = (-sin_t * sin_s + cos_t * cos_s) * p.zoom_y;

    RgbImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let src_x = a * dx + b * dy + cx + p.shift_x;
        let src_y = c * dx + d * dy + cy + p.shift_y;
        bilinear_sample_clamped(img, src_x, src_y)
    })
}

/// Bilinear sample with edge replication outside the image.
fn bilinear_sample_clamped(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut result = [0u8; 3];
    for ch in 0..3 {
        let v = p00[ch] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[ch] as f32 * fx * (1.0 - fy)
            + p01[ch] as f32 * (1.0 - fx) * fy
            + p11[ch] as f32 * fx * fy;
        result[ch] = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, 128]))
    }

    #[test]
    fn test_identity_transform_keeps_pixels() {
        let img = gradient(16, 12);
        let augmenter = Augmenter::new(AugmentationConfig::none());
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        assert_eq!(augmenter.augment(&img, &mut rng), img);
    }

    #[test]
    fn test_augment_preserves_dimensions() {
        let img = gradient(20, 10);
        let augmenter = Augmenter::new(AugmentationConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..5 {
            let out = augmenter.augment(&img, &mut rng);
            assert_eq!(out.dimensions(), (20, 10));
        }
    }

    #[test]
    fn test_augment_is_seeded() {
        let img = gradient(16, 16);
        let augmenter = Augmenter::new(AugmentationConfig::default());
        let a = augmenter.augment(&img, &mut ChaCha8Rng::seed_from_u64(99));
        let b = augmenter.augment(&img, &mut ChaCha8Rng::seed_from_u64(99));
        assert_eq!(a, b);
    }

    #[test]
    fn test_flip_only() {
        let img = gradient(8, 8);
        let config = AugmentationConfig {
            horizontal_flip: true,
            ..AugmentationConfig::none()
        };
        let augmenter = Augmenter::new(config);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let flipped = image::imageops::flip_horizontal(&img);
        for _ in 0..10 {
            let out = augmenter.augment(&img, &mut rng);
            assert!(out == img || out == flipped);
        }
    }

    #[test]
    fn test_shift_replicates_edges() {
        let img = gradient(10, 10);
        let params = AffineParams {
            theta: 0.0,
            shift_x: 100.0,
            shift_y: 0.0,
            shear: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            flip: false,
        };
        let out = warp(&img, &params);
        for y in 0..10 {
            assert_eq!(out.get_pixel(0, y), img.get_pixel(9, y));
        }
    }
}
