//! # Waste Sorter
//!
//! Waste photo classification with the Burn framework. A frozen
//! convolutional feature extractor feeds a small trainable head that scores
//! six material classes independently; the per-class probabilities are then
//! collapsed into a 0-10 recyclability score.
//!
//! ## Modules
//!
//! - `dataset`: corpus loading, seeded partitioning, transforms and the prefetching loader
//! - `model`: the classifier and its checkpoint format
//! - `training`: the epoch loop, validation and training history
//! - `inference`: single-image prediction and the recyclability score
//! - `backend`: compile-time backend selection and the runtime context
//! - `config`: TOML pipeline configuration
//! - `utils`: logging and error types
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use waste_sorter::backend::{training_context, RuntimeContext};
//! use waste_sorter::config::PipelineConfig;
//! use waste_sorter::training::Engine;
//!
//! let ctx = training_context(PipelineConfig::default())?;
//! let mut engine = Engine::from_context(&ctx)?;
//! // ... build loaders, then engine.fit(&train, &validation)
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod training;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used items for convenience
pub use backend::{RuntimeContext, TrainingBackend};
pub use config::PipelineConfig;
pub use dataset::{partition, BatchLoader, DatasetSplits, PartitionSizes, WasteBatch, WasteCorpus};
pub use inference::{score, InferenceResponse, Prediction, Predictor, ScoredPrediction};
pub use model::{WasteClassifier, WasteClassifierConfig};
pub use training::{Engine, EpochMetrics, TrainingHistory};
pub use utils::error::{BatchPosition, ErrorKind, Result, WasteSorterError};

pub use dataset::{CLASS_NAMES, NUM_CLASSES};

/// Default image side after resizing
pub const IMAGE_SIZE: u32 = 256;

/// Default probability cutoff for thresholded accuracy
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
