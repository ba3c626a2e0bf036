//! Deterministic train/validation/test partitioning
//!
//! The corpus index list `0..N` is shuffled with a seeded ChaCha8 generator
//! and cut into three consecutive runs of fixed length. Only indices are
//! moved; image data stays where the corpus keeps it.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::utils::error::{Result, WasteSorterError};

/// Fixed partition sizes. They must sum to the corpus size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSizes {
    pub train: usize,
    pub validation: usize,
    pub test: usize,
}

impl PartitionSizes {
    pub fn new(train: usize, validation: usize, test: usize) -> Self {
        Self {
            train,
            validation,
            test,
        }
    }

    pub fn total(&self) -> usize {
        self.train + self.validation + self.test
    }

    /// Sizes from fractions of `total`; the rounding remainder goes to test.
    pub fn from_fractions(total: usize, train_fraction: f64, validation_fraction: f64) -> Result<Self> {
        if train_fraction < 0.0 || validation_fraction < 0.0 || train_fraction + validation_fraction > 1.0 {
            return Err(WasteSorterError::Configuration(format!(
                "invalid split fractions: train {} + validation {} must lie in [0, 1]",
                train_fraction, validation_fraction
            )));
        }
        let train = (total as f64 * train_fraction).round() as usize;
        let validation = ((total as f64 * validation_fraction).round() as usize).min(total - train);
        Ok(Self::new(train, validation, total - train - validation))
    }
}

/// Which partition a set of indices belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Validation => write!(f, "validation"),
            Split::Test => write!(f, "test"),
        }
    }
}

/// A named subset of corpus indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub split: Split,
    pub indices: Vec<usize>,
}

impl Partition {
    pub fn new(split: Split, indices: Vec<usize>) -> Self {
        Self { split, indices }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// The three disjoint partitions of one corpus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSplits {
    pub train: Partition,
    pub validation: Partition,
    pub test: Partition,
}

impl DatasetSplits {
    pub fn get(&self, split: Split) -> &Partition {
        match split {
            Split::Train => &self.train,
            Split::Validation => &self.validation,
            Split::Test => &self.test,
        }
    }
}

/// Split `0..corpus_len` into train/validation/test.
///
/// The same seed and sizes always give the same membership.
pub fn partition(corpus_len: usize, seed: u64, sizes: PartitionSizes) -> Result<DatasetSplits> {
    if sizes.total() != corpus_len {
        return Err(WasteSorterError::Configuration(format!(
            "partition sizes {} + {} + {} = {} do not match corpus size {}",
            sizes.train,
            sizes.validation,
            sizes.test,
            sizes.total(),
            corpus_len
        )));
    }

    let mut indices: Vec<usize> = (0..corpus_len).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let test = indices.split_off(sizes.train + sizes.validation);
    let validation = indices.split_off(sizes.train);
    let train = indices;

    info!(
        "Partitioned {} samples (seed {}): train={}, validation={}, test={}",
        corpus_len,
        seed,
        train.len(),
        validation.len(),
        test.len()
    );

    Ok(DatasetSplits {
        train: Partition::new(Split::Train, train),
        validation: Partition::new(Split::Validation, validation),
        test: Partition::new(Split::Test, test),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_same_seed_same_membership() {
        let sizes = PartitionSizes::new(1593, 176, 758);
        for seed in [0, 1, 42, u64::MAX] {
            let a = partition(2527, seed, sizes).unwrap();
            let b = partition(2527, seed, sizes).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_different_seed_changes_membership() {
        let sizes = PartitionSizes::new(60, 20, 20);
        let a = partition(100, 1, sizes).unwrap();
        let b = partition(100, 2, sizes).unwrap();
        assert_ne!(a.train.indices, b.train.indices);
    }

    #[test]
    fn test_partitions_disjoint_and_cover_corpus() {
        let splits = partition(2527, 42, PartitionSizes::new(1593, 176, 758)).unwrap();
        assert_eq!(splits.train.len(), 1593);
        assert_eq!(splits.validation.len(), 176);
        assert_eq!(splits.test.len(), 758);

        let mut seen = HashSet::new();
        for split in [Split::Train, Split::Validation, Split::Test] {
            for &idx in &splits.get(split).indices {
                assert!(seen.insert(idx), "index {} appears twice", idx);
            }
        }
        assert_eq!(seen.len(), 2527);
        assert!(seen.iter().all(|&i| i < 2527));
    }

    #[test]
    fn test_size_mismatch_is_configuration_error() {
        let err = partition(100, 42, PartitionSizes::new(50, 20, 20)).unwrap_err();
        assert_eq!(err.kind(), crate::utils::error::ErrorKind::Configuration);
    }

    #[test]
    fn test_empty_partitions_allowed() {
        let splits = partition(10, 42, PartitionSizes::new(10, 0, 0)).unwrap();
        assert!(splits.validation.is_empty());
        assert!(splits.test.is_empty());
    }

    #[test]
    fn test_from_fractions_sums_to_total() {
        let sizes = PartitionSizes::from_fractions(2527, 0.63, 0.07).unwrap();
        assert_eq!(sizes.total(), 2527);
        assert!(PartitionSizes::from_fractions(10, 0.8, 0.5).is_err());
    }
}
