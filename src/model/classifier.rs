//! Waste classifier: a frozen convolutional feature extractor followed by a
//! small trainable head producing one logit per material class.
//!
//! Training mode is the model on an autodiff backend (dropout active, head
//! parameters updated by the optimizer). Evaluation mode is `model.valid()`
//! on the inner backend, where dropout is the identity and no gradients are
//! tracked.

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::BinaryCrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{activation::sigmoid, backend::Backend, ElementConversion, Int, Tensor},
};
use tracing::info;

use crate::dataset::WasteBatch;
use crate::utils::error::{self, WasteSorterError};

/// Configuration for the waste classifier
#[derive(Config, Debug)]
pub struct WasteClassifierConfig {
    /// Number of output classes
    #[config(default = "6")]
    pub num_classes: usize,

    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,

    /// Filters of the first extractor block; doubled by each following block
    #[config(default = "16")]
    pub base_filters: usize,

    /// Dropout in front of the head
    #[config(default = "0.2")]
    pub dropout: f64,
}

impl WasteClassifierConfig {
    /// Width of the embedding fed to the head
    pub fn embedding_dim(&self) -> usize {
        self.base_filters * 4
    }

    /// Build the model with a frozen extractor and a freshly initialised head
    pub fn init<B: Backend>(&self, device: &B::Device) -> WasteClassifier<B> {
        WasteClassifier {
            extractor: self.init_extractor(device),
            head: self.init_head(device),
        }
    }

    pub fn init_extractor<B: Backend>(&self, device: &B::Device) -> FeatureExtractor<B> {
        let base = self.base_filters;
        FeatureExtractor {
            blocks: vec![
                ConvBlock::new(self.in_channels, base, device),
                ConvBlock::new(base, base * 2, device),
                ConvBlock::new(base * 2, base * 4, device),
            ],
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
        .no_grad()
    }

    pub fn init_head<B: Backend>(&self, device: &B::Device) -> ClassificationHead<B> {
        ClassificationHead {
            dropout: DropoutConfig::new(self.dropout).init(),
            linear: LinearConfig::new(self.embedding_dim(), self.num_classes).init(device),
        }
    }
}

/// Conv2d, ReLU and a 2x2 max pool
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub relu: Relu,
    pub pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }
}

/// Frozen backbone mapping `[B, 3, H, W]` images to `[B, embedding_dim]`.
///
/// Its parameters never require gradients, so the optimizer leaves them alone.
#[derive(Module, Debug)]
pub struct FeatureExtractor<B: Backend> {
    pub blocks: Vec<ConvBlock<B>>,
    pub global_pool: AdaptiveAvgPool2d,
}

impl<B: Backend> FeatureExtractor<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        x.reshape([batch_size, channels])
    }

    /// Replace the weights with an externally supplied record
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> error::Result<Self> {
        info!("Loading pretrained feature extractor from {:?}", path);
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let extractor = self.load_file(path, &recorder, device).map_err(|e| {
            WasteSorterError::Configuration(format!(
                "Failed to load feature extractor weights from {}: {:?}",
                path.display(),
                e
            ))
        })?;
        Ok(extractor.no_grad())
    }
}

/// Trainable head: dropout then a linear layer, one logit per class
#[derive(Module, Debug)]
pub struct ClassificationHead<B: Backend> {
    pub dropout: Dropout,
    pub linear: Linear<B>,
}

impl<B: Backend> ClassificationHead<B> {
    pub fn forward(&self, embedding: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.dropout.forward(embedding);
        self.linear.forward(x)
    }

    /// `[embedding_dim, num_classes]`
    pub fn shape(&self) -> [usize; 2] {
        self.linear.weight.dims()
    }
}

/// Frozen extractor plus trainable head
#[derive(Module, Debug)]
pub struct WasteClassifier<B: Backend> {
    pub extractor: FeatureExtractor<B>,
    pub head: ClassificationHead<B>,
}

impl<B: Backend> WasteClassifier<B> {
    pub fn from_parts(extractor: FeatureExtractor<B>, head: ClassificationHead<B>) -> Self {
        Self { extractor, head }
    }

    /// Raw per-class logits for `[B, 3, H, W]` images. No sigmoid is applied.
    pub fn classify(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let embedding = self.extractor.forward(images);
        self.head.forward(embedding)
    }

    pub fn num_classes(&self) -> usize {
        self.head.shape()[1]
    }

    pub fn embedding_dim(&self) -> usize {
        self.head.shape()[0]
    }
}

/// Loss and thresholded accuracy of one evaluation batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

/// What the training engine needs from a model
pub trait ClassifierStep<B: Backend> {
    /// Raw logits `[B, C]`
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Mean binary cross-entropy of the batch, computed from logits
    fn compute_loss(&self, batch: &WasteBatch<B>) -> Tensor<B, 1> {
        let logits = self.forward(batch.images.clone());
        bce_with_logits(logits, batch.targets.clone())
    }

    /// Loss plus thresholded multi-label accuracy
    fn compute_eval_metrics(&self, batch: &WasteBatch<B>, threshold: f32) -> BatchMetrics {
        let logits = self.forward(batch.images.clone());
        let loss = bce_with_logits(logits.clone(), batch.targets.clone());
        let accuracy = multilabel_accuracy(sigmoid(logits), batch.targets.clone(), threshold);
        BatchMetrics {
            loss: loss.into_scalar().elem::<f64>(),
            accuracy,
        }
    }
}

impl<B: Backend> ClassifierStep<B> for WasteClassifier<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.classify(images)
    }
}

/// Binary cross-entropy applied independently per class, on raw logits
pub fn bce_with_logits<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2, Int>) -> Tensor<B, 1> {
    BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init(&logits.device())
        .forward(logits, targets)
}

/// Fraction of all `(sample, class)` slots where `prob > threshold` matches
/// the one-hot label. The denominator is batch size times class count.
pub fn multilabel_accuracy<B: Backend>(
    probs: Tensor<B, 2>,
    labels: Tensor<B, 2, Int>,
    threshold: f32,
) -> f64 {
    let [batch_size, num_classes] = probs.dims();
    let slots = batch_size * num_classes;
    if slots == 0 {
        return 0.0;
    }

    let predictions = probs.greater_elem(threshold).int();
    let correct: i64 = predictions.equal(labels).int().sum().into_scalar().elem();
    correct as f64 / slots as f64
}
