//! Dataset module for waste photo handling
//!
//! This module provides:
//! - Loading the class-per-directory corpus from disk
//! - Deterministic train/validation/test partitioning
//! - Train/eval image transforms
//! - A prefetching batch loader and typed device transfer

pub mod batcher;
pub mod corpus;
pub mod split;
pub mod transform;
pub mod transfer;

pub use batcher::{BatchLoader, HostBatch, LoaderConfig, WasteBatch};
pub use corpus::{WasteCorpus, WasteSample};
pub use split::{partition, DatasetSplits, Partition, PartitionSizes, Split};
pub use transform::ImageTransform;
pub use transfer::DeviceTransfer;

/// Number of material classes
pub const NUM_CLASSES: usize = 6;

/// Material classes, in the sorted directory order the corpus uses
pub const CLASS_NAMES: [&str; NUM_CLASSES] = ["cardboard", "glass", "metal", "paper", "plastic", "trash"];

/// Get the class name for a given label index
pub fn class_name(label: usize) -> Option<&'static str> {
    CLASS_NAMES.get(label).copied()
}

/// Get the label index of a class name
pub fn class_index(name: &str) -> Option<usize> {
    CLASS_NAMES.iter().position(|&c| c == name)
}

/// One-hot encoded label of length [`NUM_CLASSES`], as the integer targets
/// the loss takes
pub fn multi_hot(label: usize) -> [i64; NUM_CLASSES] {
    let mut encoded = [0; NUM_CLASSES];
    if label < NUM_CLASSES {
        encoded[label] = 1;
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_lookup() {
        assert_eq!(class_name(0), Some("cardboard"));
        assert_eq!(class_name(5), Some("trash"));
        assert_eq!(class_name(6), None);
        assert_eq!(class_index("plastic"), Some(4));
        assert_eq!(class_index("wood"), None);
    }

    #[test]
    fn test_multi_hot_has_single_entry() {
        for label in 0..NUM_CLASSES {
            let encoded = multi_hot(label);
            assert_eq!(encoded.len(), NUM_CLASSES);
            assert_eq!(encoded.iter().sum::<i64>(), 1);
            assert_eq!(encoded[label], 1);
        }
    }

    #[test]
    fn test_class_names_sorted() {
        let mut sorted = CLASS_NAMES;
        sorted.sort();
        assert_eq!(sorted, CLASS_NAMES);
    }
}
