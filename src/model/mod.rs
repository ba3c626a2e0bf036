//! Model module: the waste classifier and its checkpoint format

pub mod checkpoint;
pub mod classifier;

pub use checkpoint::{load_classifier, load_head, save_checkpoint, CheckpointMetadata};
pub use classifier::{
    bce_with_logits, multilabel_accuracy, BatchMetrics, ClassificationHead, ClassifierStep,
    FeatureExtractor, WasteClassifier, WasteClassifierConfig,
};
