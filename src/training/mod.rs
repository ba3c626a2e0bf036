//! Training module: the epoch loop and its metrics
//!
//! - `engine`: fit/evaluate over the prefetching loaders
//! - `metrics`: per-epoch metrics and the saved training history

pub mod engine;
pub mod metrics;

pub use engine::{evaluate_model, Engine, EngineState};
pub use metrics::{EpochMetrics, EvalMetrics, TrainingHistory};

/// File name of the saved history, next to the checkpoint
pub const HISTORY_FILE: &str = "history.json";
