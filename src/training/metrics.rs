//! Per-epoch metrics and the ordered training history

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::BatchMetrics;
use crate::utils::error::Result;

/// Mean loss and accuracy over every batch of an evaluation pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub batches: usize,
}

impl EvalMetrics {
    /// Unweighted mean of per-batch values; a short last batch counts as one
    pub fn from_batches(batches: &[BatchMetrics]) -> Self {
        let n = batches.len();
        if n == 0 {
            return Self {
                loss: 0.0,
                accuracy: 0.0,
                batches: 0,
            };
        }
        Self {
            loss: batches.iter().map(|b| b.loss).sum::<f64>() / n as f64,
            accuracy: batches.iter().map(|b| b.accuracy).sum::<f64>() / n as f64,
            batches: n,
        }
    }
}

/// One recorded epoch. Epochs are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

impl std::fmt::Display for EpochMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Epoch {}: train_loss: {:.4}, val_loss: {:.4}, val_acc: {:.4}",
            self.epoch, self.train_loss, self.val_loss, self.val_accuracy
        )
    }
}

/// Append-only list of epoch metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn epochs(&self) -> &[EpochMetrics] {
        &self.epochs
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    /// Epoch with the highest validation accuracy
    pub fn best_epoch(&self) -> Option<&EpochMetrics> {
        self.epochs
            .iter()
            .max_by(|a, b| a.val_accuracy.total_cmp(&b.val_accuracy))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Training history saved to {:?}", path);
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
