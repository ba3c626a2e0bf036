//! Training engine
//!
//! Runs the epoch loop over the prefetching loaders:
//! - Adam updates of the classification head (the extractor is frozen)
//! - Validation after every epoch in eval mode
//! - Fail-fast on corrupt images and non-finite losses

use burn::{
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, backend::Backend, ElementConversion},
};
use tracing::{debug, error, info, warn};

use super::metrics::{EpochMetrics, EvalMetrics, TrainingHistory};
use crate::backend::RuntimeContext;
use crate::dataset::BatchLoader;
use crate::model::{BatchMetrics, ClassifierStep, WasteClassifier};
use crate::utils::error::{Result, WasteSorterError};
use crate::utils::logging::TrainingLogger;

/// Where the engine is in its run
#[derive(Debug, Clone, PartialEq)]
pub enum EngineState {
    Idle,
    TrainingEpoch { epoch: usize },
    EvaluatingEpoch { epoch: usize },
    /// A pass aborted; the engine keeps the model as of the last good step
    Failed {
        epoch: usize,
        batch: usize,
        reason: String,
    },
}

/// Owns the model under training and drives fit/evaluate passes
pub struct Engine<B: AutodiffBackend> {
    model: WasteClassifier<B>,
    device: B::Device,
    epochs: usize,
    learning_rate: f64,
    threshold: f32,
    state: EngineState,
}

impl<B: AutodiffBackend> Engine<B> {
    /// Wrap an already built model
    pub fn new(ctx: &RuntimeContext<B>, model: WasteClassifier<B>) -> Self {
        let training = &ctx.config().training;
        Self {
            model,
            device: ctx.device().clone(),
            epochs: training.epochs,
            learning_rate: training.learning_rate,
            threshold: training.threshold,
            state: EngineState::Idle,
        }
    }

    /// Seed the backend, then build the classifier the context describes.
    /// The extractor comes from the configured pretrained record if any.
    pub fn from_context(ctx: &RuntimeContext<B>) -> Result<Self> {
        let config = ctx.config();
        B::seed(config.seed);

        let classifier = config.model.classifier();
        let mut model = classifier.init::<B>(ctx.device());
        if let Some(path) = &config.model.pretrained_backbone {
            let extractor = model.extractor.load_pretrained(path, ctx.device())?;
            model = WasteClassifier::from_parts(extractor, model.head);
        } else {
            warn!("No pretrained backbone configured; the extractor keeps its seeded initialisation");
        }

        info!(
            "Model ready: {} classes, {}-dim embedding, dropout {}",
            model.num_classes(),
            model.embedding_dim(),
            classifier.dropout
        );
        Ok(Self::new(ctx, model))
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Hand the trained model over for checkpointing or serving
    pub fn into_model(self) -> WasteClassifier<B> {
        self.model
    }

    /// Train for the configured number of epochs, validating after each.
    ///
    /// Returns the per-epoch history. On failure the engine moves to
    /// [`EngineState::Failed`] and the error is returned unchanged.
    pub fn fit(&mut self, train: &BatchLoader, validation: &BatchLoader) -> Result<TrainingHistory> {
        info!(
            "Training for {} epochs: {} train samples ({} batches), {} validation samples",
            self.epochs,
            train.len(),
            train.num_batches(),
            validation.len()
        );

        let mut optimizer = AdamConfig::new().init::<B, WasteClassifier<B>>();
        let mut history = TrainingHistory::new();
        let mut logger = TrainingLogger::new(self.epochs);

        for epoch in 1..=self.epochs {
            logger.start_epoch(epoch - 1);

            self.state = EngineState::TrainingEpoch { epoch };
            let train_loss = match self.train_epoch(epoch, train, &mut optimizer) {
                Ok(loss) => loss,
                Err(err) => return Err(self.fail(epoch, err)),
            };

            self.state = EngineState::EvaluatingEpoch { epoch };
            let eval = match self.run_eval(epoch, validation) {
                Ok(eval) => eval,
                Err(err) => return Err(self.fail(epoch, err)),
            };

            let metrics = EpochMetrics {
                epoch,
                train_loss,
                val_loss: eval.loss,
                val_accuracy: eval.accuracy,
            };
            info!("{}", metrics);
            debug!("Epoch {} took {:.1}s", epoch, logger.epoch_seconds());
            history.record(metrics);
        }

        self.state = EngineState::Idle;
        logger.log_complete(history.last().map(|m| m.val_accuracy).unwrap_or(0.0));
        Ok(history)
    }

    /// Score the current model on a loader without training
    pub fn evaluate(&mut self, loader: &BatchLoader) -> Result<EvalMetrics> {
        self.state = EngineState::EvaluatingEpoch { epoch: 0 };
        match self.run_eval(0, loader) {
            Ok(metrics) => {
                self.state = EngineState::Idle;
                Ok(metrics)
            }
            Err(err) => Err(self.fail(0, err)),
        }
    }

    fn train_epoch<O>(&mut self, epoch: usize, loader: &BatchLoader, optimizer: &mut O) -> Result<f64>
    where
        O: Optimizer<WasteClassifier<B>, B>,
    {
        let num_batches = loader.num_batches();
        let mut total_loss = 0.0;
        let mut seen = 0usize;

        let batches = loader.iter::<B>(&self.device).map_err(|e| e.at_batch(epoch, 0))?;
        for (batch_idx, batch) in batches.enumerate() {
            let batch = batch.map_err(|e| e.at_batch(epoch, batch_idx))?;

            let loss = self.model.compute_loss(&batch);
            let loss_value: f64 = loss.clone().into_scalar().elem();
            if !loss_value.is_finite() {
                return Err(WasteSorterError::Training {
                    epoch,
                    batch: batch_idx,
                    reason: format!("non-finite training loss {}", loss_value),
                });
            }
            total_loss += loss_value;
            seen += 1;

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = optimizer.step(self.learning_rate, self.model.clone(), grads);

            if (batch_idx + 1) % 10 == 0 || batch_idx + 1 == num_batches {
                debug!("  Batch {}/{}: loss = {:.4}", batch_idx + 1, num_batches, loss_value);
            }
        }

        if seen == 0 {
            warn!("Epoch {} had no training batches", epoch);
            return Ok(0.0);
        }
        Ok(total_loss / seen as f64)
    }

    fn run_eval(&self, epoch: usize, loader: &BatchLoader) -> Result<EvalMetrics> {
        let model = self.model.valid();
        eval_pass(&model, loader, self.threshold, &self.device, epoch)
    }

    fn fail(&mut self, epoch: usize, err: WasteSorterError) -> WasteSorterError {
        let batch = err.batch_position().map(|p| p.batch).unwrap_or(0);
        error!("Run aborted in epoch {}: {}", epoch, err);
        self.state = EngineState::Failed {
            epoch,
            batch,
            reason: err.to_string(),
        };
        err
    }
}

/// One full pass of `loader` through an eval-mode model: mean loss and
/// thresholded accuracy over its batches.
pub fn evaluate_model<B: Backend>(
    model: &WasteClassifier<B>,
    loader: &BatchLoader,
    threshold: f32,
    device: &B::Device,
) -> Result<EvalMetrics> {
    eval_pass(model, loader, threshold, device, 0)
}

fn eval_pass<B: Backend>(
    model: &WasteClassifier<B>,
    loader: &BatchLoader,
    threshold: f32,
    device: &B::Device,
    epoch: usize,
) -> Result<EvalMetrics> {
    let mut per_batch: Vec<BatchMetrics> = Vec::with_capacity(loader.num_batches());

    let batches = loader.iter::<B>(device).map_err(|e| e.at_batch(epoch, 0))?;
    for (batch_idx, batch) in batches.enumerate() {
        let batch = batch.map_err(|e| e.at_batch(epoch, batch_idx))?;
        let metrics = model.compute_eval_metrics(&batch, threshold);
        if !metrics.loss.is_finite() {
            return Err(WasteSorterError::Training {
                epoch,
                batch: batch_idx,
                reason: format!("non-finite evaluation loss {}", metrics.loss),
            });
        }
        per_batch.push(metrics);
    }

    Ok(EvalMetrics::from_batches(&per_batch))
}
