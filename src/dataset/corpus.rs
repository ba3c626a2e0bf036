//! Waste photo corpus
//!
//! Loads a class-per-subdirectory image tree into an ordered, indexable list
//! of (path, label) pairs. Classes are the sorted directory names and files
//! are sorted within each class, so the index of a sample is stable across
//! runs and platforms.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageReader};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{multi_hot, CLASS_NAMES, NUM_CLASSES};
use crate::utils::error::{Result, ResultExt, WasteSorterError};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// A single image sample with its label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasteSample {
    /// Path to the image file
    pub path: PathBuf,
    /// Class label index (0-5)
    pub label: usize,
}

impl WasteSample {
    pub fn new(path: impl Into<PathBuf>, label: usize) -> Self {
        Self {
            path: path.into(),
            label,
        }
    }

    /// One-hot label vector
    pub fn target(&self) -> [i64; NUM_CLASSES] {
        multi_hot(self.label)
    }
}

/// Ordered collection of labeled samples
#[derive(Debug, Clone, Default)]
pub struct WasteCorpus {
    samples: Vec<WasteSample>,
}

impl WasteCorpus {
    /// Load a corpus from a directory laid out as
    ///
    /// ```text
    /// root/
    /// ├── cardboard/
    /// ├── glass/
    /// ├── metal/
    /// ├── paper/
    /// ├── plastic/
    /// └── trash/
    /// ```
    pub fn from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        info!("Loading waste corpus from: {:?}", root);

        if !root.is_dir() {
            return Err(WasteSorterError::Configuration(format!(
                "Dataset directory does not exist: {}",
                root.display()
            )));
        }

        let mut class_dirs: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    class_dirs.push(name.to_string());
                }
            }
        }
        class_dirs.sort();

        if class_dirs.iter().map(String::as_str).ne(CLASS_NAMES.iter().copied()) {
            return Err(WasteSorterError::Configuration(format!(
                "expected class directories {:?}, found {:?}",
                CLASS_NAMES, class_dirs
            )));
        }

        let mut samples = Vec::new();
        for (label, class_name) in class_dirs.iter().enumerate() {
            let before = samples.len();
            for entry in WalkDir::new(root.join(class_name))
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
            {
                let entry = entry.data_context(&root.join(class_name))?;
                let path = entry.path();
                if entry.file_type().is_file() && is_image_file(path) {
                    samples.push(WasteSample::new(path, label));
                }
            }
            debug!("Class '{}' (label {}): {} samples", class_name, label, samples.len() - before);
        }

        info!("Loaded {} samples across {} classes", samples.len(), NUM_CLASSES);
        Ok(Self { samples })
    }

    /// Build a corpus from an explicit list of samples
    pub fn from_samples(samples: Vec<WasteSample>) -> Result<Self> {
        if let Some(bad) = samples.iter().find(|s| s.label >= NUM_CLASSES) {
            return Err(WasteSorterError::Configuration(format!(
                "sample {} has label {} outside 0..{}",
                bad.path.display(),
                bad.label,
                NUM_CLASSES
            )));
        }
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&WasteSample> {
        self.samples.get(index)
    }

    pub fn samples(&self) -> &[WasteSample] {
        &self.samples
    }

    /// Samples per class, indexed by label
    pub fn class_counts(&self) -> [usize; NUM_CLASSES] {
        let mut counts = [0; NUM_CLASSES];
        for sample in &self.samples {
            counts[sample.label] += 1;
        }
        counts
    }
}

/// Whether a path has one of the supported image extensions
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Open and decode an image file. Missing or undecodable files are data errors.
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    ImageReader::open(path)
        .data_context(path)?
        .with_guessed_format()
        .data_context(path)?
        .decode()
        .data_context(path)
}

/// Decode an in-memory image
pub fn decode_image_bytes(bytes: &[u8]) -> Result<DynamicImage> {
    let source = Path::new("<bytes>");
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .data_context(source)?
        .decode()
        .data_context(source)
}
