//! Waste Sorter CLI
//!
//! Trains the waste classifier on a class-per-directory photo corpus,
//! evaluates saved checkpoints and scores single images.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use burn::module::AutodiffModule;
use burn::tensor::backend::Backend;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use walkdir::WalkDir;

use waste_sorter::backend::{backend_name, resolve_device, training_context, DefaultBackend, RuntimeContext};
use waste_sorter::config::PipelineConfig;
use waste_sorter::dataset::corpus::is_image_file;
use waste_sorter::dataset::{partition, BatchLoader, Split, WasteCorpus, CLASS_NAMES};
use waste_sorter::inference::{InferenceResponse, Predictor};
use waste_sorter::model::{load_classifier, save_checkpoint};
use waste_sorter::training::{evaluate_model, Engine, EvalMetrics, HISTORY_FILE};
use waste_sorter::utils::format_duration;
use waste_sorter::utils::logging::{init_logging, LogConfig, LogLevel};
use waste_sorter::TrainingBackend;

/// Waste photo classification and recyclability scoring
#[derive(Parser, Debug)]
#[command(name = "waste_sorter")]
#[command(version)]
#[command(about = "Waste photo classification and recyclability scoring with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, default_value = "false", conflicts_with = "verbose")]
    quiet: bool,

    /// Explicit log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Pipeline configuration (TOML); defaults are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train the classification head and save a checkpoint
    Train {
        /// Corpus root with one subdirectory per class
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Number of training epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Batch size for training
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Learning rate
        #[arg(short, long)]
        learning_rate: Option<f64>,

        /// Checkpoint output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Random seed for reproducibility
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Score a checkpoint on the validation or test partition
    Evaluate {
        /// Corpus root with one subdirectory per class
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Checkpoint directory
        #[arg(short = 'm', long)]
        checkpoint: Option<PathBuf>,

        /// Partition to score
        #[arg(short, long, value_enum, default_value = "test")]
        split: SplitArg,
    },

    /// Classify an image (or every image in a directory) and print JSON
    Predict {
        /// Image file or directory of images
        #[arg(short, long)]
        input: PathBuf,

        /// Checkpoint directory
        #[arg(short = 'm', long)]
        checkpoint: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SplitArg {
    Validation,
    Test,
}

impl From<SplitArg> for Split {
    fn from(arg: SplitArg) -> Self {
        match arg {
            SplitArg::Validation => Split::Validation,
            SplitArg::Test => Split::Test,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = if cli.verbose {
        LogConfig::verbose()
    } else if cli.quiet {
        LogConfig::quiet()
    } else {
        LogConfig::default()
    };
    if let Some(level) = &cli.log_level {
        log_config.level = LogLevel::parse(level);
    }
    let _ = init_logging(&log_config);

    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    match cli.command {
        Commands::Train {
            data_dir,
            epochs,
            batch_size,
            learning_rate,
            output_dir,
            seed,
        } => {
            print_banner();
            let mut config = config;
            if let Some(dir) = data_dir {
                config.data.data_dir = dir;
            }
            if let Some(epochs) = epochs {
                config.training.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.data.batch_size = batch_size;
                config.data.eval_batch_size = 2 * batch_size;
            }
            if let Some(lr) = learning_rate {
                config.training.learning_rate = lr;
            }
            if let Some(dir) = output_dir {
                config.training.checkpoint_dir = dir.clone();
                config.inference.checkpoint_dir = dir;
            }
            if let Some(seed) = seed {
                config.seed = seed;
            }
            cmd_train(config)?;
        }

        Commands::Evaluate {
            data_dir,
            checkpoint,
            split,
        } => {
            print_banner();
            let mut config = config;
            if let Some(dir) = data_dir {
                config.data.data_dir = dir;
            }
            if let Some(dir) = checkpoint {
                config.inference.checkpoint_dir = dir;
            }
            cmd_evaluate(config, split.into())?;
        }

        Commands::Predict { input, checkpoint } => {
            let mut config = config;
            if let Some(dir) = checkpoint {
                config.inference.checkpoint_dir = dir;
            }
            cmd_predict(config, &input)?;
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔══════════════════════════════════════════════════════╗
 ║   ♻  Waste Sorter                                    ║
 ║   Material classification and recyclability scores   ║
 ╚══════════════════════════════════════════════════════╝
  "#
        .green()
    );
}

/// Load the corpus and cut the configured partitions
fn load_partitions(config: &PipelineConfig) -> Result<(Arc<WasteCorpus>, waste_sorter::DatasetSplits)> {
    let corpus = WasteCorpus::from_dir(&config.data.data_dir)
        .with_context(|| format!("Failed to load corpus from {:?}", config.data.data_dir))?;

    println!("{}", "Corpus".cyan().bold());
    for (name, count) in CLASS_NAMES.iter().zip(corpus.class_counts()) {
        println!("  {:<10} {:>5}", name, count);
    }

    let splits = partition(corpus.len(), config.seed, config.data.partition)?;
    println!(
        "  train {} / validation {} / test {} (seed {})\n",
        splits.train.len(),
        splits.validation.len(),
        splits.test.len(),
        config.seed
    );
    Ok((Arc::new(corpus), splits))
}

fn print_eval(label: &str, metrics: &EvalMetrics) {
    println!(
        "  {:<12} loss {:.4}  accuracy {}",
        label,
        metrics.loss,
        format!("{:.2}%", metrics.accuracy * 100.0).green().bold()
    );
}

fn cmd_train(config: PipelineConfig) -> Result<()> {
    let start = Instant::now();
    let ctx = training_context(config)?;
    let config = ctx.config();

    let (corpus, splits) = load_partitions(config)?;
    let train = BatchLoader::for_split(Arc::clone(&corpus), &splits, Split::Train, config)?;
    let validation = BatchLoader::for_split(Arc::clone(&corpus), &splits, Split::Validation, config)?;
    let test = BatchLoader::for_split(corpus, &splits, Split::Test, config)?;

    let mut engine = Engine::<TrainingBackend>::from_context(&ctx)?;

    let baseline = engine.evaluate(&validation)?;
    info!("Baseline: val_loss: {:.4}, val_acc: {:.4}", baseline.loss, baseline.accuracy);

    let history = engine.fit(&train, &validation)?;
    let test_metrics = engine.evaluate(&test)?;

    let model = engine.into_model().valid();
    let checkpoint_dir = &config.training.checkpoint_dir;
    save_checkpoint(&model, checkpoint_dir, config.data.image_size, history.len())?;
    history.save(&checkpoint_dir.join(HISTORY_FILE))?;

    println!("\n{}", "Results".cyan().bold());
    print_eval("baseline", &baseline);
    if let Some(last) = history.last() {
        println!("  {}", last);
    }
    if let Some(best) = history.best_epoch() {
        println!("  best epoch   {} (val_acc {:.4})", best.epoch, best.val_accuracy);
    }
    print_eval("test", &test_metrics);
    println!(
        "\n{} Checkpoint saved to {:?} in {}",
        "✔".green(),
        checkpoint_dir,
        format_duration(start.elapsed().as_secs_f64())
    );
    Ok(())
}

fn cmd_evaluate(config: PipelineConfig, split: Split) -> Result<()> {
    config.validate()?;
    let device = resolve_device(config.device)?;
    info!("Backend: {} ({:?})", backend_name(), device);

    let (corpus, splits) = load_partitions(&config)?;
    let loader = BatchLoader::for_split(corpus, &splits, split, &config)?;

    DefaultBackend::seed(config.seed);
    let model = load_classifier::<DefaultBackend>(
        &config.inference.checkpoint_dir,
        &config.model.classifier(),
        config.data.image_size,
        config.model.pretrained_backbone.as_deref(),
        &device,
    )?;

    let metrics = evaluate_model(&model, &loader, config.training.threshold, &device)?;
    println!("{}", "Evaluation".cyan().bold());
    print_eval(&split.to_string(), &metrics);
    Ok(())
}

fn cmd_predict(config: PipelineConfig, input: &Path) -> Result<()> {
    config.validate()?;
    let device = resolve_device(config.device)?;
    let ctx = RuntimeContext::<DefaultBackend>::new(device, config);
    let predictor = Predictor::from_checkpoint(&ctx)?;

    if !input.is_dir() {
        let response = InferenceResponse::from(predictor.predict_external(input));
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    let images: Vec<PathBuf> = WalkDir::new(input)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.is_file() && is_image_file(p))
        .collect();

    let progress = ProgressBar::new(images.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} images ({eta})")?
            .progress_chars("=>-"),
    );

    let mut responses = BTreeMap::new();
    for path in images {
        let response = InferenceResponse::from(predictor.predict_external(&path));
        responses.insert(path.display().to_string(), response);
        progress.inc(1);
    }
    progress.finish_and_clear();

    println!("{}", serde_json::to_string_pretty(&responses)?);
    Ok(())
}
