//! Head checkpoint persistence
//!
//! A checkpoint directory holds the trainable head as a named burn record
//! (parameter name to tensor), the frozen extractor it was trained against,
//! and a JSON sidecar describing the head's shape.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::classifier::{ClassificationHead, WasteClassifier, WasteClassifierConfig};
use crate::dataset::CLASS_NAMES;
use crate::utils::error::{Result, WasteSorterError};

/// Record file stems; the recorder appends `.mpk`
pub const HEAD_FILE: &str = "head";
pub const EXTRACTOR_FILE: &str = "extractor";
pub const METADATA_FILE: &str = "metadata.json";

/// Shape and provenance of a saved head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub num_classes: usize,
    pub embedding_dim: usize,
    /// Side of the square input the head was trained on
    pub image_size: u32,
    pub class_names: Vec<String>,
    pub epochs_trained: usize,
    pub created_at: String,
    pub version: String,
}

impl CheckpointMetadata {
    pub fn for_model<B: Backend>(model: &WasteClassifier<B>, image_size: u32, epochs_trained: usize) -> Self {
        Self {
            num_classes: model.num_classes(),
            embedding_dim: model.embedding_dim(),
            image_size,
            class_names: CLASS_NAMES.iter().map(|c| c.to_string()).collect(),
            epochs_trained,
            created_at: chrono::Utc::now().to_rfc3339(),
            version: crate::VERSION.to_string(),
        }
    }

    /// Reject a checkpoint that does not fit the configured model and input size
    pub fn check_compatible(&self, config: &WasteClassifierConfig, image_size: u32) -> Result<()> {
        if self.num_classes != config.num_classes {
            return Err(WasteSorterError::Configuration(format!(
                "checkpoint has {} classes but the model expects {}",
                self.num_classes, config.num_classes
            )));
        }
        if self.embedding_dim != config.embedding_dim() {
            return Err(WasteSorterError::Configuration(format!(
                "checkpoint head takes {}-dim embeddings but the extractor produces {}",
                self.embedding_dim,
                config.embedding_dim()
            )));
        }
        if self.image_size != image_size {
            return Err(WasteSorterError::Configuration(format!(
                "checkpoint was trained on {}px images but the pipeline feeds {}px",
                self.image_size, image_size
            )));
        }
        if self.class_names.iter().map(String::as_str).ne(CLASS_NAMES.iter().copied()) {
            return Err(WasteSorterError::Configuration(format!(
                "checkpoint classes {:?} differ from {:?}",
                self.class_names, CLASS_NAMES
            )));
        }
        Ok(())
    }
}

fn head_path(dir: &Path) -> PathBuf {
    dir.join(HEAD_FILE)
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// Write the model's head, extractor and metadata into `dir`
pub fn save_checkpoint<B: Backend>(
    model: &WasteClassifier<B>,
    dir: &Path,
    image_size: u32,
    epochs_trained: usize,
) -> Result<CheckpointMetadata> {
    info!("Saving checkpoint to {:?}", dir);
    fs::create_dir_all(dir)?;

    model
        .head
        .clone()
        .save_file(head_path(dir), &recorder())
        .map_err(|e| WasteSorterError::Serialization(format!("Failed to save head: {:?}", e)))?;
    save_extractor(model, &dir.join(EXTRACTOR_FILE))?;

    let metadata = CheckpointMetadata::for_model(model, image_size, epochs_trained);
    fs::write(dir.join(METADATA_FILE), serde_json::to_string_pretty(&metadata)?)?;

    info!(
        "Checkpoint saved ({} classes, {}-dim embedding, {} epochs)",
        metadata.num_classes, metadata.embedding_dim, metadata.epochs_trained
    );
    Ok(metadata)
}

/// Read the metadata sidecar of a checkpoint
pub fn load_metadata(dir: &Path) -> Result<CheckpointMetadata> {
    let path = dir.join(METADATA_FILE);
    if !path.exists() {
        return Err(WasteSorterError::Configuration(format!(
            "Checkpoint not found: {}",
            path.display()
        )));
    }
    let content = fs::read_to_string(&path)?;
    serde_json::from_str(&content).map_err(|e| {
        WasteSorterError::Configuration(format!("Invalid checkpoint metadata {}: {}", path.display(), e))
    })
}

/// Load a head checkpoint shaped for `config` and `image_size` inputs
pub fn load_head<B: Backend>(
    dir: &Path,
    config: &WasteClassifierConfig,
    image_size: u32,
    device: &B::Device,
) -> Result<ClassificationHead<B>> {
    let metadata = load_metadata(dir)?;
    metadata.check_compatible(config, image_size)?;

    let head = config
        .init_head::<B>(device)
        .load_file(head_path(dir), &recorder(), device)
        .map_err(|e| {
            WasteSorterError::Configuration(format!("Failed to load head from {}: {:?}", dir.display(), e))
        })?;

    // The record itself is not shape-checked on load
    let expected = [config.embedding_dim(), config.num_classes];
    if head.shape() != expected {
        return Err(WasteSorterError::Configuration(format!(
            "checkpoint head has shape {:?}, expected {:?}",
            head.shape(),
            expected
        )));
    }

    info!("Loaded head checkpoint from {:?} ({} epochs trained)", dir, metadata.epochs_trained);
    Ok(head)
}

/// Rebuild a full classifier for serving.
///
/// The extractor comes from the checkpoint itself when it carries one, then
/// from `pretrained_backbone`, and only as a last resort from the current
/// backend initialisation.
pub fn load_classifier<B: Backend>(
    dir: &Path,
    config: &WasteClassifierConfig,
    image_size: u32,
    pretrained_backbone: Option<&Path>,
    device: &B::Device,
) -> Result<WasteClassifier<B>> {
    let extractor = config.init_extractor::<B>(device);
    let saved = dir.join(EXTRACTOR_FILE).with_extension("mpk");
    let extractor = if saved.exists() {
        extractor.load_pretrained(&saved, device)?
    } else if let Some(path) = pretrained_backbone {
        extractor.load_pretrained(path, device)?
    } else {
        warn!("Checkpoint has no extractor and no pretrained backbone is configured; using a fresh initialisation");
        extractor
    };
    let head = load_head(dir, config, image_size, device)?;
    Ok(WasteClassifier::from_parts(extractor, head))
}

/// Save only the extractor weights, in the format `load_pretrained` reads
pub fn save_extractor<B: Backend>(model: &WasteClassifier<B>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    model
        .extractor
        .clone()
        .save_file(path, &recorder())
        .map_err(|e| WasteSorterError::Serialization(format!("Failed to save extractor: {:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::ErrorKind;
    use burn::tensor::Tensor;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type B = NdArray<f32>;

    fn config() -> WasteClassifierConfig {
        WasteClassifierConfig::new().with_base_filters(4)
    }

    #[test]
    fn test_checkpoint_roundtrip_restores_logits() -> Result<()> {
        let _guard = crate::test_utils::backend_lock();
        let dir = tempfile::tempdir()?;
        let device = NdArrayDevice::Cpu;
        let model = config().with_dropout(0.0).init::<B>(&device);

        let metadata = save_checkpoint(&model, dir.path(), 8, 3)?;
        assert_eq!(metadata.epochs_trained, 3);
        assert_eq!(load_metadata(dir.path())?.image_size, 8);
        assert!(dir.path().join("extractor.mpk").exists());

        let restored = load_classifier::<B>(dir.path(), &config().with_dropout(0.0), 8, None, &device)?;
        let input = Tensor::<B, 4>::ones([1, 3, 8, 8], &device);
        let before = model.classify(input.clone()).into_data().to_vec::<f32>().unwrap();
        let after = restored.classify(input).into_data().to_vec::<f32>().unwrap();
        assert_eq!(before, after);
        Ok(())
    }

    #[test]
    fn test_class_count_mismatch_is_configuration_error() -> Result<()> {
        let _guard = crate::test_utils::backend_lock();
        let dir = tempfile::tempdir()?;
        let device = NdArrayDevice::Cpu;
        save_checkpoint(&config().init::<B>(&device), dir.path(), 8, 1)?;

        let err = load_head::<B>(dir.path(), &config().with_num_classes(4), 8, &device).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = load_head::<B>(dir.path(), &config().with_base_filters(8), 8, &device).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        Ok(())
    }

    #[test]
    fn test_image_size_mismatch_is_configuration_error() -> Result<()> {
        let _guard = crate::test_utils::backend_lock();
        let dir = tempfile::tempdir()?;
        let device = NdArrayDevice::Cpu;
        save_checkpoint(&config().init::<B>(&device), dir.path(), 16, 1)?;

        assert!(load_head::<B>(dir.path(), &config(), 16, &device).is_ok());
        let err = load_head::<B>(dir.path(), &config(), 256, &device).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("16px"));
        Ok(())
    }

    #[test]
    fn test_head_record_disagreeing_with_metadata_is_rejected() -> Result<()> {
        let _guard = crate::test_utils::backend_lock();
        let dir = tempfile::tempdir()?;
        let device = NdArrayDevice::Cpu;
        let wide = WasteClassifierConfig::new().with_base_filters(8);
        save_checkpoint(&wide.init::<B>(&device), dir.path(), 8, 1)?;

        // Sidecar claims the 16-dim head that base_filters=4 expects
        let mut metadata = load_metadata(dir.path())?;
        assert_eq!(metadata.embedding_dim, 32);
        metadata.embedding_dim = 16;
        fs::write(dir.path().join(METADATA_FILE), serde_json::to_string_pretty(&metadata)?)?;

        let err = load_head::<B>(dir.path(), &config(), 8, &device).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        Ok(())
    }

    #[test]
    fn test_pretrained_backbone_used_when_checkpoint_has_none() -> Result<()> {
        let _guard = crate::test_utils::backend_lock();
        let dir = tempfile::tempdir()?;
        let device = NdArrayDevice::Cpu;
        let model = config().init::<B>(&device);

        let backbone = dir.path().join("backbone");
        save_extractor(&model, &backbone)?;
        save_checkpoint(&model, &dir.path().join("ckpt"), 8, 1)?;
        fs::remove_file(dir.path().join("ckpt").join("extractor.mpk"))?;

        let restored = load_classifier::<B>(
            &dir.path().join("ckpt"),
            &config(),
            8,
            Some(&backbone.with_extension("mpk")),
            &device,
        )?;
        let input = Tensor::<B, 4>::ones([2, 3, 8, 8], &device);
        let before = model.classify(input.clone()).into_data().to_vec::<f32>().unwrap();
        let after = restored.classify(input).into_data().to_vec::<f32>().unwrap();
        assert_eq!(before, after);
        Ok(())
    }

    #[test]
    fn test_missing_checkpoint_is_configuration_error() {
        let err = load_metadata(Path::new("/no/such/checkpoint")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
