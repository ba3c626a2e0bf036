//! Single-image prediction
//!
//! Wraps an eval-mode classifier and turns an image (path, bytes or decoded)
//! into per-class probabilities plus a recyclability score. Every failure is
//! returned as a `Result`; callers that face users convert it into an
//! [`InferenceResponse`].

use std::path::Path;

use burn::tensor::{activation::sigmoid, backend::Backend, Tensor, TensorData};
use image::DynamicImage;
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use super::scoring::score;
use crate::backend::RuntimeContext;
use crate::dataset::corpus::{decode_image_bytes, load_image};
use crate::dataset::{class_index, ImageTransform, CLASS_NAMES, NUM_CLASSES};
use crate::model::{load_classifier, WasteClassifier};
use crate::utils::error::{ErrorKind, Result, WasteSorterError};

/// Per-class sigmoid probabilities, in class-table order. Every entry is a
/// finite value in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    probabilities: [f32; NUM_CLASSES],
}

impl Prediction {
    pub fn new(probabilities: [f32; NUM_CLASSES]) -> Result<Self> {
        if let Some((class, p)) = CLASS_NAMES
            .iter()
            .zip(probabilities.iter())
            .find(|(_, p)| !(0.0..=1.0).contains(*p))
        {
            return Err(WasteSorterError::Inference(format!(
                "probability {} for '{}' is outside [0, 1]",
                p, class
            )));
        }
        Ok(Self { probabilities })
    }

    pub fn probabilities(&self) -> &[f32; NUM_CLASSES] {
        &self.probabilities
    }

    /// Probability of a class by name
    pub fn get(&self, class: &str) -> Option<f32> {
        class_index(class).map(|i| self.probabilities[i])
    }

    /// `(class name, probability)` pairs in class-table order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f32)> + '_ {
        CLASS_NAMES.iter().copied().zip(self.probabilities.iter().copied())
    }

    /// Most likely class
    pub fn top(&self) -> (&'static str, f32) {
        self.iter()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap_or((CLASS_NAMES[0], 0.0))
    }
}

// Serialized as a `{class: probability}` object in class-table order
impl Serialize for Prediction {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

/// A prediction with its recyclability score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredPrediction {
    pub prediction: Prediction,
    pub recycling_score: f32,
}

impl ScoredPrediction {
    pub fn new(prediction: Prediction) -> Self {
        Self {
            recycling_score: score(&prediction),
            prediction,
        }
    }
}

/// External JSON shape of a single-image request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InferenceResponse {
    Success {
        predicted_labels: Prediction,
        recycling_score: f32,
    },
    Failure {
        msg: String,
    },
}

impl From<Result<ScoredPrediction>> for InferenceResponse {
    fn from(result: Result<ScoredPrediction>) -> Self {
        match result {
            Ok(scored) => InferenceResponse::Success {
                predicted_labels: scored.prediction,
                recycling_score: scored.recycling_score,
            },
            Err(err) => {
                warn!("Prediction failed: {}", err);
                let msg = match err.kind() {
                    ErrorKind::Data => "The image could not be read",
                    _ => "An error occurred while classifying the image",
                };
                InferenceResponse::Failure { msg: msg.to_string() }
            }
        }
    }
}

/// Eval-mode classifier plus the eval transform. Cheap to clone; each clone
/// can serve requests on its own thread.
#[derive(Debug, Clone)]
pub struct Predictor<B: Backend> {
    model: WasteClassifier<B>,
    transform: ImageTransform,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    /// Serve an in-memory model
    pub fn new(ctx: &RuntimeContext<B>, model: WasteClassifier<B>) -> Self {
        Self {
            model,
            transform: ImageTransform::eval(ctx.config().data.image_size),
            device: ctx.device().clone(),
        }
    }

    /// Load the checkpoint named by the inference config
    pub fn from_checkpoint(ctx: &RuntimeContext<B>) -> Result<Self> {
        let config = ctx.config();
        B::seed(config.seed);

        let model = load_classifier::<B>(
            &config.inference.checkpoint_dir,
            &config.model.classifier(),
            config.data.image_size,
            config.model.pretrained_backbone.as_deref(),
            ctx.device(),
        )?;
        info!("Predictor ready from {:?}", config.inference.checkpoint_dir);
        Ok(Self::new(ctx, model))
    }

    /// Probabilities for one decoded image
    pub fn predict(&self, image: &DynamicImage) -> Result<Prediction> {
        let size = self.transform.image_size() as usize;
        let pixels = self.transform.apply_eval(image);
        let input = Tensor::<B, 4>::from_data(TensorData::new(pixels, [1, 3, size, size]), &self.device);

        let probs = sigmoid(self.model.classify(input));
        let [_, width] = probs.dims();
        if width != NUM_CLASSES {
            return Err(WasteSorterError::Inference(format!(
                "model produced {} outputs for {} classes",
                width, NUM_CLASSES
            )));
        }

        let values = probs
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| WasteSorterError::Inference(format!("Failed to read probabilities: {:?}", e)))?;
        let probabilities: [f32; NUM_CLASSES] = values.as_slice().try_into().map_err(|_| {
            WasteSorterError::Inference(format!("expected {} probabilities, got {}", NUM_CLASSES, values.len()))
        })?;

        Prediction::new(probabilities)
    }

    /// Load, predict and score an image file
    pub fn predict_external(&self, path: &Path) -> Result<ScoredPrediction> {
        let image = load_image(path)?;
        let scored = ScoredPrediction::new(self.predict(&image)?);
        let (class, p) = scored.prediction.top();
        debug!(
            "{:?}: {} ({:.3}), recycling score {:.2}/10",
            path, class, p, scored.recycling_score
        );
        Ok(scored)
    }

    /// Decode, predict and score an encoded image
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<ScoredPrediction> {
        let image = decode_image_bytes(bytes)?;
        Ok(ScoredPrediction::new(self.predict(&image)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::model::save_checkpoint;
    use crate::test_utils::{backend_lock, write_class_images};
    use burn_ndarray::{NdArray, NdArrayDevice};

    type B = NdArray<f32>;

    fn context(checkpoint_dir: &Path) -> RuntimeContext<B> {
        let mut config = PipelineConfig::default();
        config.data.image_size = 16;
        config.model.base_filters = 4;
        config.inference.checkpoint_dir = checkpoint_dir.to_path_buf();
        RuntimeContext::new(NdArrayDevice::Cpu, config)
    }

    fn predictor(ctx: &RuntimeContext<B>) -> Predictor<B> {
        B::seed(ctx.config().seed);
        let model = ctx.config().model.classifier().init::<B>(ctx.device());
        Predictor::new(ctx, model)
    }

    #[test]
    fn test_prediction_covers_every_class() -> Result<()> {
        let _guard = backend_lock();
        let dir = tempfile::tempdir()?;
        let ctx = context(dir.path());
        let images = write_class_images(dir.path(), 24)?;

        let scored = predictor(&ctx).predict_external(&images[0])?;
        let entries: Vec<_> = scored.prediction.iter().collect();
        assert_eq!(entries.len(), NUM_CLASSES);
        assert!(entries.iter().all(|(_, p)| (0.0..=1.0).contains(p)));
        assert!((0.0..=10.0).contains(&scored.recycling_score));
        Ok(())
    }

    #[test]
    fn test_missing_path_is_data_error() -> Result<()> {
        let _guard = backend_lock();
        let dir = tempfile::tempdir()?;
        let ctx = context(dir.path());

        let err = predictor(&ctx)
            .predict_external(&dir.path().join("missing.jpg"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Data);
        Ok(())
    }

    #[test]
    fn test_corrupt_file_is_data_error() -> Result<()> {
        let _guard = backend_lock();
        let dir = tempfile::tempdir()?;
        let ctx = context(dir.path());
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"\xFF\xD8 definitely not a jpeg")?;

        let predictor = predictor(&ctx);
        assert_eq!(predictor.predict_external(&path).unwrap_err().kind(), ErrorKind::Data);
        assert_eq!(predictor.predict_bytes(b"garbage").unwrap_err().kind(), ErrorKind::Data);
        Ok(())
    }

    #[test]
    fn test_checkpoint_predictor_matches_trained_model() -> Result<()> {
        let _guard = backend_lock();
        let dir = tempfile::tempdir()?;
        let ctx = context(&dir.path().join("checkpoint"));
        let images = write_class_images(dir.path(), 24)?;

        let live = predictor(&ctx);
        let config = ctx.config();
        save_checkpoint(&live.model, &config.inference.checkpoint_dir, config.data.image_size, 1)?;
        let served = Predictor::<B>::from_checkpoint(&ctx)?;

        for path in &images {
            assert_eq!(live.predict_external(path)?, served.predict_external(path)?);
        }
        Ok(())
    }

    #[test]
    fn test_clones_serve_from_threads() -> Result<()> {
        let _guard = backend_lock();
        let dir = tempfile::tempdir()?;
        let ctx = context(dir.path());
        let images = write_class_images(dir.path(), 24)?;
        let predictor = predictor(&ctx);
        let expected = predictor.predict_external(&images[2])?;

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let predictor = predictor.clone();
                let path = images[2].clone();
                std::thread::spawn(move || predictor.predict_external(&path))
            })
            .collect();
        for handle in handles {
            let result = handle.join().expect("worker panicked")?;
            assert_eq!(result, expected);
        }
        Ok(())
    }

    #[test]
    fn test_prediction_rejects_out_of_range_values() {
        let mut probs = [0.0; NUM_CLASSES];
        probs[0] = 1.0;
        assert!(Prediction::new(probs).is_ok());

        for bad in [-0.9, 1.5, f32::NAN, f32::INFINITY] {
            let mut probs = probs;
            probs[1] = bad;
            let err = Prediction::new(probs).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Inference);
            assert!(err.to_string().contains("glass"));
        }
    }

    #[test]
    fn test_head_width_mismatch_is_inference_error() -> Result<()> {
        let _guard = backend_lock();
        let dir = tempfile::tempdir()?;
        let ctx = context(dir.path());
        let images = write_class_images(dir.path(), 24)?;

        B::seed(ctx.config().seed);
        let model = ctx.config().model.classifier().with_num_classes(4).init::<B>(ctx.device());
        let predictor = Predictor::new(&ctx, model);

        let result = predictor.predict_external(&images[0]);
        assert_eq!(result.as_ref().unwrap_err().kind(), ErrorKind::Inference);

        let json = serde_json::to_value(InferenceResponse::from(result)).unwrap();
        assert_eq!(json["msg"], "An error occurred while classifying the image");
        assert!(json.get("predicted_labels").is_none());
        Ok(())
    }

    #[test]
    fn test_response_json_shapes() {
        let mut probs = [0.0; NUM_CLASSES];
        probs[0] = 1.0;
        let ok = InferenceResponse::from(Ok(ScoredPrediction::new(Prediction::new(probs).unwrap())));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["predicted_labels"]["cardboard"], 1.0);
        assert_eq!(json["predicted_labels"].as_object().map(|m| m.len()), Some(NUM_CLASSES));
        assert_eq!(json["recycling_score"], 7.5);

        let failed = InferenceResponse::from(Err(WasteSorterError::data(
            "/secret/upload/path.jpg",
            "bad header",
        )));
        let json = serde_json::to_string(&failed).unwrap();
        assert!(json.starts_with("{\"msg\":"));
        assert!(!json.contains("/secret"));
    }
}
