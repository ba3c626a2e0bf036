//! Shared fixtures for unit tests

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use image::{Rgb, RgbImage};

use crate::dataset::{WasteCorpus, CLASS_NAMES, NUM_CLASSES};
use crate::utils::error::Result;

static BACKEND_RNG: Mutex<()> = Mutex::new(());

/// Serializes tests that seed or draw from the global backend RNG
pub fn backend_lock() -> MutexGuard<'static, ()> {
    BACKEND_RNG.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Base colour of a class; distinct enough for a tiny model to separate
pub fn class_colour(label: usize) -> Rgb<u8> {
    Rgb([
        (label * 40 % 256) as u8,
        (255 - label * 40 % 256) as u8,
        (label * 97 % 255) as u8,
    ])
}

/// Write a `size`x`size` image with a per-sample brightness ripple
pub fn write_sample(path: &Path, label: usize, variant: usize, size: u32) -> Result<()> {
    let base = class_colour(label);
    let shift = (variant * 7 % 23) as u8;
    let img = RgbImage::from_fn(size, size, |x, y| {
        let ripple = ((x + y) % 4) as u8 * 3;
        Rgb([
            base[0].saturating_add(shift + ripple),
            base[1].saturating_sub(shift),
            base[2].saturating_add(ripple),
        ])
    });
    img.save(path)
        .map_err(|e| crate::utils::error::WasteSorterError::data(path, e.to_string()))
}

/// One image per class, returned in label order
pub fn write_class_images(dir: &Path, size: u32) -> Result<Vec<PathBuf>> {
    (0..NUM_CLASSES)
        .map(|label| {
            let path = dir.join(format!("{}.png", CLASS_NAMES[label]));
            write_sample(&path, label, 0, size)?;
            Ok(path)
        })
        .collect()
}

/// A class-per-directory corpus with `per_class` images in every class
pub fn write_synthetic_corpus(root: &Path, per_class: usize, size: u32) -> Result<WasteCorpus> {
    for (label, class) in CLASS_NAMES.iter().enumerate() {
        let class_dir = root.join(class);
        std::fs::create_dir_all(&class_dir)?;
        for variant in 0..per_class {
            write_sample(&class_dir.join(format!("{:03}.png", variant)), label, variant, size)?;
        }
    }
    WasteCorpus::from_dir(root)
}
