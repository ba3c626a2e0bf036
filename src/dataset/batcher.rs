//! Prefetching batch loader
//!
//! A producer thread decodes and transforms upcoming batches on a bounded
//! rayon pool and pushes finished host batches into a bounded FIFO channel.
//! The consumer turns each host batch into device tensors, so batch `k+1` is
//! being loaded while the caller works on batch `k`.
//!
//! A decode failure ends the pass: the failing batch is reported as an error
//! and nothing after it is produced.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::corpus::{load_image, WasteCorpus};
use super::split::{DatasetSplits, Partition, Split};
use super::transfer::DeviceTransfer;
use super::transform::{sample_rng, ImageTransform};
use super::NUM_CLASSES;
use crate::config::PipelineConfig;
use crate::utils::error::{Result, WasteSorterError};

/// Loader settings for one partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Fresh random order on every pass (train) or fixed order (eval)
    pub shuffle: bool,
    /// Worker threads for decode/transform
    pub num_workers: usize,
    /// Host batches buffered ahead of the consumer
    pub prefetch: usize,
    /// Seeds shuffling and augmentation
    pub seed: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: false,
            num_workers: 4,
            prefetch: 2,
            seed: 42,
        }
    }
}

/// A batch as plain host memory, ready to be turned into tensors
#[derive(Debug, Clone)]
pub struct HostBatch {
    /// Corpus indices of the samples, in batch order
    pub indices: Vec<usize>,
    /// `[n, 3, size, size]` image data, row-major
    pub images: Vec<f32>,
    /// `[n, NUM_CLASSES]` one-hot labels
    pub targets: Vec<i64>,
    pub image_size: usize,
}

impl HostBatch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Upload the batch straight onto `device`. The pair still goes through
    /// [`DeviceTransfer`], which leaves tensors already resident on `device`
    /// untouched.
    pub fn into_device<B: Backend>(self, device: &B::Device) -> WasteBatch<B> {
        let n = self.len();
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(self.images, [n, 3, self.image_size, self.image_size]),
            device,
        );
        let targets = Tensor::<B, 2, Int>::from_data(TensorData::new(self.targets, [n, NUM_CLASSES]), device);

        let (images, targets) = (images, targets).transfer(device);
        WasteBatch {
            images,
            targets,
            indices: self.indices,
        }
    }
}

/// A batch on the compute device
#[derive(Debug, Clone)]
pub struct WasteBatch<B: Backend> {
    /// `[n, 3, H, W]` normalized images
    pub images: Tensor<B, 4>,
    /// `[n, NUM_CLASSES]` one-hot labels
    pub targets: Tensor<B, 2, Int>,
    /// Corpus indices of the samples
    pub indices: Vec<usize>,
}

impl<B: Backend> WasteBatch<B> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Lazy, restartable batch source over one partition
pub struct BatchLoader {
    corpus: Arc<WasteCorpus>,
    indices: Arc<Vec<usize>>,
    transform: ImageTransform,
    config: LoaderConfig,
    pool: Arc<ThreadPool>,
    passes: AtomicU64,
}

impl BatchLoader {
    pub fn new(
        corpus: Arc<WasteCorpus>,
        partition: &Partition,
        transform: ImageTransform,
        config: LoaderConfig,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(WasteSorterError::Configuration("batch_size must be positive".into()));
        }
        if config.num_workers == 0 {
            return Err(WasteSorterError::Configuration("num_workers must be at least 1".into()));
        }
        if let Some(&bad) = partition.indices.iter().find(|&&i| i >= corpus.len()) {
            return Err(WasteSorterError::Configuration(format!(
                "{} partition references index {} but the corpus has {} samples",
                partition.split,
                bad,
                corpus.len()
            )));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_workers)
            .thread_name(|i| format!("loader-{}", i))
            .build()
            .map_err(|e| WasteSorterError::Configuration(format!("Failed to build loader pool: {}", e)))?;

        debug!(
            "{} loader: {} samples, batch size {}, shuffle={}, augment={}, {} workers",
            partition.split,
            partition.len(),
            config.batch_size,
            config.shuffle,
            transform.is_augmenting(),
            config.num_workers
        );

        Ok(Self {
            corpus,
            indices: Arc::new(partition.indices.clone()),
            transform,
            config,
            pool: Arc::new(pool),
            passes: AtomicU64::new(0),
        })
    }

    /// Loader for one split with the pipeline's settings. The train split is
    /// augmented and reshuffled every pass; the others keep partition order.
    pub fn for_split(
        corpus: Arc<WasteCorpus>,
        splits: &DatasetSplits,
        split: Split,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let size = config.data.image_size;
        let (transform, loader) = match split {
            Split::Train => (ImageTransform::train(size), config.data.train_loader(config.seed)),
            Split::Validation | Split::Test => {
                (ImageTransform::eval(size), config.data.eval_loader(config.seed))
            }
        };
        Self::new(corpus, splits.get(split), transform, loader)
    }

    /// Number of samples per pass
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// `ceil(len / batch_size)`; the last batch may be short
    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.config.batch_size)
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Sample order of a given pass
    pub fn pass_order(&self, pass: u64) -> Vec<usize> {
        let mut order = self.indices.as_ref().clone();
        if self.config.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(pass));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Start the next full pass
    pub fn iter<B: Backend>(&self, device: &B::Device) -> Result<BatchIter<B>> {
        let pass = self.passes.fetch_add(1, Ordering::SeqCst);
        self.iter_pass(pass, device)
    }

    /// Start a specific pass; the order depends only on the seed and `pass`
    pub fn iter_pass<B: Backend>(&self, pass: u64, device: &B::Device) -> Result<BatchIter<B>> {
        let order = self.pass_order(pass);
        let (tx, rx) = sync_channel::<Result<HostBatch>>(self.config.prefetch.max(1));

        let corpus = Arc::clone(&self.corpus);
        let pool = Arc::clone(&self.pool);
        let transform = self.transform.clone();
        let batch_size = self.config.batch_size;
        let seed = self.config.seed;

        let handle = thread::Builder::new()
            .name("batch-prefetch".to_string())
            .spawn(move || {
                for chunk in order.chunks(batch_size) {
                    let batch = load_host_batch(&pool, &corpus, &transform, chunk, seed, pass);
                    let failed = batch.is_err();
                    // A closed channel means the consumer stopped early
                    if tx.send(batch).is_err() || failed {
                        break;
                    }
                }
            })?;

        Ok(BatchIter {
            rx: Some(rx),
            handle: Some(handle),
            device: device.clone(),
            finished: false,
            _backend: PhantomData,
        })
    }
}

/// Decode and transform one batch on the worker pool, keeping batch order
fn load_host_batch(
    pool: &ThreadPool,
    corpus: &WasteCorpus,
    transform: &ImageTransform,
    chunk: &[usize],
    seed: u64,
    pass: u64,
) -> Result<HostBatch> {
    let decoded: Vec<(Vec<f32>, [i64; NUM_CLASSES])> = pool.install(|| {
        chunk
            .par_iter()
            .map(|&idx| {
                let sample = corpus.get(idx).ok_or_else(|| {
                    WasteSorterError::Configuration(format!("sample index {} out of range", idx))
                })?;
                let img = load_image(&sample.path)?;
                let mut rng = sample_rng(seed, pass, idx);
                Ok((transform.apply(&img, &mut rng), sample.target()))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut images = Vec::with_capacity(chunk.len() * transform.output_len());
    let mut targets = Vec::with_capacity(chunk.len() * NUM_CLASSES);
    for (pixels, target) in decoded {
        images.extend(pixels);
        targets.extend(target);
    }

    Ok(HostBatch {
        indices: chunk.to_vec(),
        images,
        targets,
        image_size: transform.image_size() as usize,
    })
}

/// One pass over a loader. Dropping it stops the producer.
pub struct BatchIter<B: Backend> {
    rx: Option<Receiver<Result<HostBatch>>>,
    handle: Option<JoinHandle<()>>,
    device: B::Device,
    finished: bool,
    _backend: PhantomData<B>,
}

impl<B: Backend> Iterator for BatchIter<B> {
    type Item = Result<WasteBatch<B>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let rx = self.rx.as_ref()?;
        match rx.recv() {
            Ok(Ok(host)) => Some(Ok(host.into_device(&self.device))),
            Ok(Err(err)) => {
                self.finished = true;
                Some(Err(err))
            }
            Err(_) => {
                self.finished = true;
                None
            }
        }
    }
}

impl<B: Backend> Drop for BatchIter<B> {
    fn drop(&mut self) {
        // Closing the receiver unblocks a producer waiting on a full queue
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("batch prefetch thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::corpus::WasteSample;
    use crate::dataset::split::{partition, PartitionSizes, Split};
    use crate::test_utils::write_class_images;
    use crate::utils::error::ErrorKind;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type B = NdArray<f32>;

    fn eval_config(batch_size: usize) -> LoaderConfig {
        LoaderConfig {
            batch_size,
            ..LoaderConfig::default()
        }
    }

    #[test]
    fn test_test_partition_batches() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let files = write_class_images(dir.path(), 8)?;
        let samples = (0..2527)
            .map(|i| WasteSample::new(files[i % files.len()].clone(), i % files.len()))
            .collect();
        let corpus = Arc::new(WasteCorpus::from_samples(samples)?);
        let splits = partition(corpus.len(), 42, PartitionSizes::new(1593, 176, 758))?;

        let loader = BatchLoader::new(corpus, &splits.test, ImageTransform::eval(8), eval_config(32))?;
        assert_eq!(loader.num_batches(), 24);

        let sizes: Vec<usize> = loader
            .iter::<B>(&NdArrayDevice::Cpu)?
            .map(|batch| batch.map(|b| b.len()))
            .collect::<Result<_>>()?;
        assert_eq!(sizes.len(), 24);
        assert!(sizes[..23].iter().all(|&s| s == 32));
        assert_eq!(sizes[23], 22);
        Ok(())
    }

    #[test]
    fn test_exact_multiple_has_no_short_batch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let files = write_class_images(dir.path(), 8)?;
        let samples = (0..12).map(|i| WasteSample::new(&files[i % 6], i % 6)).collect();
        let corpus = Arc::new(WasteCorpus::from_samples(samples)?);
        let part = Partition::new(Split::Validation, (0..12).collect());

        let loader = BatchLoader::new(corpus, &part, ImageTransform::eval(8), eval_config(4))?;
        assert_eq!(loader.num_batches(), 3);

        let batches: Vec<WasteBatch<B>> = loader.iter::<B>(&NdArrayDevice::Cpu)?.collect::<Result<_>>()?;
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 4 && b.images.dims()[0] == 4));
        assert_eq!(batches[2].indices, vec![8, 9, 10, 11]);
        Ok(())
    }

    #[test]
    fn test_eval_order_and_tensor_shapes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let files = write_class_images(dir.path(), 8)?;
        let samples = files.iter().enumerate().map(|(i, p)| WasteSample::new(p, i)).collect();
        let corpus = Arc::new(WasteCorpus::from_samples(samples)?);
        let part = Partition::new(Split::Validation, vec![5, 0, 3, 1, 4, 2]);

        let loader = BatchLoader::new(corpus, &part, ImageTransform::eval(8), eval_config(4))?;
        let batches: Vec<WasteBatch<B>> = loader.iter::<B>(&NdArrayDevice::Cpu)?.collect::<Result<_>>()?;

        assert_eq!(batches[0].indices, vec![5, 0, 3, 1]);
        assert_eq!(batches[1].indices, vec![4, 2]);
        assert_eq!(batches[0].images.dims(), [4, 3, 8, 8]);
        assert_eq!(batches[1].targets.dims(), [2, NUM_CLASSES]);

        let targets = batches[1].targets.clone().into_data().to_vec::<i64>().unwrap();
        assert_eq!(targets, vec![0, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_shuffle_fresh_per_pass_and_reproducible() -> Result<()> {
        let samples = (0..64).map(|i| WasteSample::new(format!("{i}.png"), i % NUM_CLASSES)).collect();
        let corpus = Arc::new(WasteCorpus::from_samples(samples)?);
        let part = Partition::new(Split::Train, (0..64).collect());
        let config = LoaderConfig {
            shuffle: true,
            seed: 7,
            ..LoaderConfig::default()
        };

        let a = BatchLoader::new(Arc::clone(&corpus), &part, ImageTransform::train(8), config.clone())?;
        let b = BatchLoader::new(corpus, &part, ImageTransform::train(8), config)?;

        assert_eq!(a.pass_order(0), b.pass_order(0));
        assert_ne!(a.pass_order(0), a.pass_order(1));

        let mut sorted = a.pass_order(3);
        sorted.sort();
        assert_eq!(sorted, part.indices);
        Ok(())
    }

    #[test]
    fn test_corrupt_image_fails_fast() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let files = write_class_images(dir.path(), 8)?;
        let corrupt = dir.path().join("corrupt.png");
        std::fs::write(&corrupt, b"\x89PNG broken")?;

        let mut samples: Vec<WasteSample> = (0..12).map(|i| WasteSample::new(&files[i % 6], i % 6)).collect();
        samples[5] = WasteSample::new(&corrupt, 5);
        let corpus = Arc::new(WasteCorpus::from_samples(samples)?);
        let part = Partition::new(Split::Test, (0..12).collect());

        let loader = BatchLoader::new(corpus, &part, ImageTransform::eval(8), eval_config(4))?;
        let results: Vec<Result<WasteBatch<B>>> = loader.iter::<B>(&NdArrayDevice::Cpu)?.collect();

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().kind(), ErrorKind::Data);
        Ok(())
    }

    #[test]
    fn test_dropping_iterator_early_stops_producer() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let files = write_class_images(dir.path(), 8)?;
        let samples = (0..40).map(|i| WasteSample::new(&files[i % 6], i % 6)).collect();
        let corpus = Arc::new(WasteCorpus::from_samples(samples)?);
        let part = Partition::new(Split::Train, (0..40).collect());
        let config = LoaderConfig {
            batch_size: 2,
            prefetch: 1,
            ..LoaderConfig::default()
        };

        let loader = BatchLoader::new(corpus, &part, ImageTransform::eval(8), config)?;
        let mut iter = loader.iter::<B>(&NdArrayDevice::Cpu)?;
        assert!(iter.next().is_some());
        drop(iter);

        // A second pass still works after an abandoned one
        assert_eq!(loader.iter::<B>(&NdArrayDevice::Cpu)?.count(), 20);
        Ok(())
    }

    #[test]
    fn test_out_of_range_partition_rejected() -> Result<()> {
        let corpus = Arc::new(WasteCorpus::from_samples(vec![WasteSample::new("a.png", 0)])?);
        let part = Partition::new(Split::Test, vec![0, 3]);
        let err = BatchLoader::new(corpus, &part, ImageTransform::eval(8), LoaderConfig::default()).err();
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Configuration));
        Ok(())
    }
}
