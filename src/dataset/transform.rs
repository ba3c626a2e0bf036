//! Image transforms
//!
//! Eval: resize to a square, convert to CHW floats in [0, 1], normalize each
//! channel with mean 0.5 / std 0.5 so values land in [-1, 1].
//! Train: the same, with a random horizontal flip and a small random rotation
//! applied after the resize.

use image::{imageops::FilterType, DynamicImage, ImageBuffer, Rgb, RgbImage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Per-channel normalization mean (RGB)
pub const NORMALIZE_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
/// Per-channel normalization std (RGB)
pub const NORMALIZE_STD: [f32; 3] = [0.5, 0.5, 0.5];

/// Random augmentations used on the training partition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Augmentation {
    /// Probability of a horizontal flip
    pub horizontal_flip_prob: f32,
    /// Rotation is drawn uniformly from ±rotation_degrees
    pub rotation_degrees: f32,
}

impl Default for Augmentation {
    fn default() -> Self {
        Self {
            horizontal_flip_prob: 0.5,
            rotation_degrees: 10.0,
        }
    }
}

/// Image to tensor-data transform with a fixed output contract:
/// `3 * image_size * image_size` floats in CHW order.
#[derive(Debug, Clone)]
pub struct ImageTransform {
    image_size: u32,
    augmentation: Option<Augmentation>,
}

impl ImageTransform {
    /// Deterministic evaluation/inference transform
    pub fn eval(image_size: u32) -> Self {
        Self {
            image_size,
            augmentation: None,
        }
    }

    /// Training transform with the default augmentations
    pub fn train(image_size: u32) -> Self {
        Self {
            image_size,
            augmentation: Some(Augmentation::default()),
        }
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Number of floats produced per image
    pub fn output_len(&self) -> usize {
        3 * self.image_size as usize * self.image_size as usize
    }

    pub fn is_augmenting(&self) -> bool {
        self.augmentation.is_some()
    }

    /// Full pipeline: resize, augment (when configured), tensor conversion and
    /// normalization. `rng` drives the augmentation and is ignored otherwise.
    pub fn apply(&self, img: &DynamicImage, rng: &mut ChaCha8Rng) -> Vec<f32> {
        let mut rgb = img
            .resize_exact(self.image_size, self.image_size, FilterType::Triangle)
            .to_rgb8();

        if let Some(aug) = &self.augmentation {
            if rng.gen::<f32>() < aug.horizontal_flip_prob {
                rgb = image::imageops::flip_horizontal(&rgb);
            }
            if aug.rotation_degrees > 0.0 {
                let angle = rng.gen_range(-aug.rotation_degrees..=aug.rotation_degrees);
                rgb = rotate(&rgb, angle);
            }
        }

        to_normalized_chw(&rgb)
    }

    /// Eval-path shortcut that needs no generator
    pub fn apply_eval(&self, img: &DynamicImage) -> Vec<f32> {
        let rgb = img
            .resize_exact(self.image_size, self.image_size, FilterType::Triangle)
            .to_rgb8();
        to_normalized_chw(&rgb)
    }
}

/// Generator for one sample of one pass. Depends only on its inputs, so
/// augmentation does not change with worker scheduling.
pub fn sample_rng(seed: u64, pass: u64, index: usize) -> ChaCha8Rng {
    let mixed = seed
        ^ pass.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (index as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    ChaCha8Rng::seed_from_u64(mixed)
}

/// CHW layout: all R values, then all G values, then all B values
fn to_normalized_chw(rgb: &RgbImage) -> Vec<f32> {
    let (width, height) = rgb.dimensions();
    let num_pixels = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * num_pixels];

    for (i, pixel) in rgb.pixels().enumerate() {
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            data[c * num_pixels + i] = (value - NORMALIZE_MEAN[c]) / NORMALIZE_STD[c];
        }
    }

    data
}

/// Rotate about the centre with bilinear sampling; uncovered corners are black.
fn rotate(img: &RgbImage, angle_degrees: f32) -> RgbImage {
    if angle_degrees.abs() < 0.1 {
        return img.clone();
    }

    let angle_rad = angle_degrees.to_radians();
    let (width, height) = img.dimensions();
    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;
    let (sin_a, cos_a) = angle_rad.sin_cos();

    let mut output = ImageBuffer::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let src_x = cx + dx * cos_a + dy * sin_a;
            let src_y = cy - dx * sin_a + dy * cos_a;
            output.put_pixel(x, y, bilinear_sample(img, src_x, src_y));
        }
    }
    output
}

fn bilinear_sample(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    if x < 0.0 || y < 0.0 || x > (width - 1) as f32 || y > (height - 1) as f32 {
        return Rgb([0, 0, 0]);
    }

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
    for c in 0..3 {
        let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f32 * fx * (1.0 - fy)
            + p01[c] as f32 * (1.0 - fx) * fy
            + p11[c] as f32 * fx * fy;
        result[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(result)
}
