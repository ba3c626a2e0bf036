//! Pipeline configuration.
//!
//! Every section carries defaults matching the reference garbage
//! classification run, so a TOML file only needs the keys it overrides.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backend::DeviceChoice;
use crate::dataset::batcher::LoaderConfig;
use crate::dataset::split::PartitionSizes;
use crate::dataset::NUM_CLASSES;
use crate::model::WasteClassifierConfig;
use crate::utils::error::{Result, ResultExt, WasteSorterError};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Random seed for partitioning, shuffling, augmentation and weight init
    pub seed: u64,
    /// Compute device request
    pub device: DeviceChoice,
    pub data: DataConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub inference: InferenceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            device: DeviceChoice::Auto,
            data: DataConfig::default(),
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            inference: InferenceConfig::default(),
        }
    }
}

/// Corpus location, partitioning and loader settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Class-per-subdirectory image tree
    pub data_dir: PathBuf,
    /// Fixed train/validation/test sizes
    pub partition: PartitionSizes,
    /// Square side images are resized to
    pub image_size: u32,
    pub batch_size: usize,
    /// Batch size of the validation and test loaders
    pub eval_batch_size: usize,
    /// Decode/transform worker threads
    pub num_workers: usize,
    /// Host batches buffered ahead of the consumer
    pub prefetch: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/garbage_classification"),
            partition: PartitionSizes::new(1593, 176, 758),
            image_size: crate::IMAGE_SIZE,
            batch_size: 32,
            eval_batch_size: 64,
            num_workers: 4,
            prefetch: 2,
        }
    }
}

impl DataConfig {
    /// Loader settings for the shuffled training partition
    pub fn train_loader(&self, seed: u64) -> LoaderConfig {
        LoaderConfig {
            batch_size: self.batch_size,
            shuffle: true,
            num_workers: self.num_workers,
            prefetch: self.prefetch,
            seed,
        }
    }

    /// Loader settings for validation/test partitions (fixed order)
    pub fn eval_loader(&self, seed: u64) -> LoaderConfig {
        LoaderConfig {
            batch_size: self.eval_batch_size,
            shuffle: false,
            num_workers: self.num_workers,
            prefetch: self.prefetch,
            seed,
        }
    }
}

/// Classifier shape and backbone weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Filters of the first extractor block
    pub base_filters: usize,
    /// Dropout in front of the classification head
    pub dropout: f64,
    /// Optional record of pretrained feature extractor weights
    pub pretrained_backbone: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_filters: 16,
            dropout: 0.2,
            pretrained_backbone: None,
        }
    }
}

impl ModelConfig {
    pub fn classifier(&self) -> WasteClassifierConfig {
        WasteClassifierConfig::new()
            .with_num_classes(NUM_CLASSES)
            .with_base_filters(self.base_filters)
            .with_dropout(self.dropout)
    }
}

/// Optimisation hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    /// Adam step size
    pub learning_rate: f64,
    /// Positive/negative cutoff for thresholded accuracy
    pub threshold: f32,
    /// Where the head checkpoint and history are written
    pub checkpoint_dir: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            learning_rate: 5.5e-5,
            threshold: crate::DEFAULT_THRESHOLD,
            checkpoint_dir: PathBuf::from("output/checkpoint"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Checkpoint directory loaded on service startup
    pub checkpoint_dir: PathBuf,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("output/checkpoint"),
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_toml_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that would otherwise fail deep inside a run
    pub fn validate(&self) -> Result<()> {
        let data = &self.data;
        let training = &self.training;

        if data.batch_size == 0 || data.eval_batch_size == 0 {
            return Err(WasteSorterError::Configuration(
                "batch sizes must be positive".to_string(),
            ));
        }
        if data.num_workers == 0 {
            return Err(WasteSorterError::Configuration(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if data.image_size < 8 {
            return Err(WasteSorterError::Configuration(format!(
                "image_size {} is too small for the feature extractor",
                data.image_size
            )));
        }
        if !(training.learning_rate.is_finite() && training.learning_rate > 0.0) {
            return Err(WasteSorterError::Configuration(format!(
                "learning_rate must be positive, got {}",
                training.learning_rate
            )));
        }
        if !(training.threshold > 0.0 && training.threshold < 1.0) {
            return Err(WasteSorterError::Configuration(format!(
                "threshold must lie in (0, 1), got {}",
                training.threshold
            )));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(WasteSorterError::Configuration(format!(
                "dropout must lie in [0, 1), got {}",
                self.model.dropout
            )));
        }
        if self.model.base_filters == 0 {
            return Err(WasteSorterError::Configuration(
                "base_filters must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read and deserialize any TOML config file
pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .config_context(&format!("Failed to read config {}", path.display()))?;
    toml::from_str(&content).config_context(&format!("Failed to parse config {}", path.display()))
}
