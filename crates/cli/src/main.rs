use std::path::{Path, PathBuf};

use anyhow::Result;
use candle_core::Device;
use clap::{Parser, Subcommand};

use alexnet_common::{AlexNetConfig, ImageFolderDataset, RecordSource, TensorDataset};
use alexnet_train::{CsvMetricsSink, StagnationDecay, Trainer, TrainerConfig, TrainingLoop};

#[derive(Parser, Debug)]
#[command(name = "alexnet", about = "Train and evaluate an AlexNet-style image classifier")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train from scratch or resume from a safetensors snapshot.
    Train(TrainArgs),
    /// 10-crop evaluation of a trained model directory.
    Evaluate(EvaluateArgs),
    /// Per-channel pixel mean of an image folder (the augmentation mean).
    ComputeMean(ComputeMeanArgs),
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    /// Model config; written with defaults if missing.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Full trainer config as JSON. Overrides the hyper-parameter flags.
    #[arg(long)]
    train_config: Option<PathBuf>,
    /// `<dir>/<class_id>/*.jpg`, class ids starting at 1.
    #[arg(long, required_unless_present = "synthetic")]
    train_dir: Option<PathBuf>,
    #[arg(long)]
    eval_dir: Option<PathBuf>,
    /// Train on N random images instead of a folder (smoke runs).
    #[arg(long)]
    synthetic: Option<usize>,
    #[arg(long, default_value = "checkpoints")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 128)]
    batch_size: usize,
    /// Images per augmentation round.
    #[arg(long, default_value_t = 128)]
    raw_batch_size: usize,
    #[arg(long, default_value_t = 90)]
    epochs: usize,
    #[arg(long, default_value_t = 0.02)]
    lr: f64,
    #[arg(long, default_value_t = 0.0)]
    lr_min: f64,
    #[arg(long, default_value = "exponential", value_parser = ["exponential", "inverse"])]
    lr_decay: String,
    #[arg(long, default_value_t = 0.5)]
    lr_decay_factor: f64,
    #[arg(long, default_value_t = 0.9)]
    momentum: f64,
    #[arg(long, default_value_t = 5e-4)]
    weight_decay: f64,
    #[arg(long)]
    nesterov: bool,
    #[arg(long, default_value_t = 256)]
    image_size: u32,
    #[arg(long, default_value_t = 1)]
    save_every: usize,
    #[arg(long, default_value_t = 100)]
    log_every: usize,
    #[arg(long, default_value_t = 0)]
    debug_every: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Safetensors snapshot to start from.
    #[arg(long)]
    resume: Option<PathBuf>,
    /// Epochs already completed by the resumed snapshot.
    #[arg(long, default_value_t = 0)]
    start_epoch: usize,
    #[arg(long)]
    no_progress: bool,
}

// ── Evaluate / Compute-mean ────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct EvaluateArgs {
    /// Directory holding config.json and model.safetensors.
    #[arg(long)]
    model_dir: PathBuf,
    #[arg(long)]
    data_dir: PathBuf,
    #[arg(long, default_value_t = 128)]
    batch_size: usize,
    #[arg(long, default_value_t = 128)]
    raw_batch_size: usize,
}

#[derive(Parser, Debug)]
struct ComputeMeanArgs {
    #[arg(long)]
    data_dir: PathBuf,
    #[arg(long, default_value_t = 256)]
    image_size: u32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Evaluate(args) => cmd_evaluate(args),
        Command::ComputeMean(args) => cmd_compute_mean(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn trainer_config_from_args(args: &TrainArgs) -> Result<TrainerConfig> {
    if let Some(ref path) = args.train_config {
        let mut cfg = TrainerConfig::load(path)?;
        cfg.output_dir = args.output_dir.clone();
        return Ok(cfg);
    }
    Ok(TrainerConfig {
        batch_size: args.batch_size,
        raw_batch_size: args.raw_batch_size,
        epochs: args.epochs,
        lr: args.lr,
        lr_min: args.lr_min,
        lr_decay: StagnationDecay::from_str(&args.lr_decay, args.lr_decay_factor)?,
        momentum: args.momentum,
        weight_decay: args.weight_decay,
        nesterov: args.nesterov,
        image_size: Some(args.image_size),
        save_every: args.save_every,
        log_every: args.log_every,
        debug_every: args.debug_every,
        seed: args.seed,
        output_dir: args.output_dir.clone(),
        ..Default::default()
    })
}

fn open_source(dir: &Path, image_size: Option<u32>) -> Result<Box<dyn RecordSource>> {
    let ds = ImageFolderDataset::open(dir, image_size)?;
    eprintln!(
        "{}: {} images, {} classes",
        dir.display(),
        ds.len(),
        ds.num_classes()
    );
    Ok(Box::new(ds))
}

fn cmd_train(args: TrainArgs) -> Result<()> {
    let model_config = if args.config.exists() {
        AlexNetConfig::load(&args.config)?
    } else {
        let default = AlexNetConfig::default();
        default.save(&args.config)?;
        eprintln!("Created default config at {}", args.config.display());
        default
    };

    let mut trainer_config = trainer_config_from_args(&args)?;
    trainer_config.crop_size = model_config.input_size;

    let device = Device::cuda_if_available(0)?;
    let image_size = trainer_config.image_size;
    let train: Box<dyn RecordSource> = match (args.synthetic, &args.train_dir) {
        (Some(n), _) => {
            let size = image_size.map_or(model_config.input_size, |s| s as usize);
            eprintln!("Synthetic data: {n} images of {size}x{size}");
            Box::new(TensorDataset::synthetic(
                n,
                size,
                model_config.num_classes,
                &Device::Cpu,
            )?)
        }
        (None, Some(dir)) => open_source(dir, image_size)?,
        (None, None) => anyhow::bail!("--train-dir or --synthetic is required"),
    };
    let eval = match args.eval_dir {
        Some(ref dir) => Some(open_source(dir, image_size)?),
        None => None,
    };

    let mut trainer = Trainer::new(model_config, trainer_config, device)?;
    if let Some(ref path) = args.resume {
        trainer.load_weights(path)?;
        eprintln!(
            "Resumed from {} (epoch {}, lr {:.2e})",
            path.display(),
            args.start_epoch,
            trainer.current_lr()
        );
    }

    let mut sink = CsvMetricsSink::create(&args.output_dir.join("metrics.csv"))?;
    let mut training = TrainingLoop::new(trainer)?.with_progress(!args.no_progress);
    training.set_epochs_done(args.start_epoch);

    let summaries = training.fit(train.as_ref(), eval.as_deref(), &mut sink)?;
    for s in &summaries {
        match s.eval {
            Some(e) => eprintln!(
                "Epoch: {}, Loss: {:.4}, Accuracy: {:.2}, Test Loss: {:.4}, Test Accuracy: {:.2}, lr {:.2e}",
                s.epoch, s.train.loss, s.train.accuracy, e.loss, e.accuracy, s.lr
            ),
            None => eprintln!(
                "Epoch: {}, Loss: {:.4}, Accuracy: {:.2}, lr {:.2e}",
                s.epoch, s.train.loss, s.train.accuracy, s.lr
            ),
        }
    }
    eprintln!(
        "Training done. Saved to {}",
        args.output_dir.join("model.safetensors").display()
    );
    Ok(())
}

fn cmd_evaluate(args: EvaluateArgs) -> Result<()> {
    let model_config = AlexNetConfig::load(&args.model_dir.join("config.json"))?;
    let train_config_path = args.model_dir.join("train_config.json");
    let base = if train_config_path.exists() {
        TrainerConfig::load(&train_config_path)?
    } else {
        TrainerConfig::default()
    };
    let trainer_config = TrainerConfig {
        batch_size: args.batch_size,
        raw_batch_size: args.raw_batch_size,
        crop_size: model_config.input_size,
        output_dir: args.model_dir.clone(),
        ..base
    };
    let image_size = trainer_config.image_size;

    let device = Device::cuda_if_available(0)?;
    let mut trainer = Trainer::new(model_config, trainer_config, device)?;
    trainer.load_weights(&args.model_dir.join("model.safetensors"))?;

    let source = open_source(&args.data_dir, image_size)?;
    let mut training = TrainingLoop::new(trainer)?.with_progress(true);
    let result = training.eval_pass(source.as_ref())?;

    println!("Loss: {:.4}", result.loss);
    println!("Accuracy: {:.2}%", result.accuracy);
    println!(
        "Crops: {} in {} mini-batches ({} dropped)",
        result.report.mini_batches * args.batch_size,
        result.report.mini_batches,
        result.report.dropped_samples
    );
    Ok(())
}

fn cmd_compute_mean(args: ComputeMeanArgs) -> Result<()> {
    let ds = ImageFolderDataset::open(&args.data_dir, Some(args.image_size))?;
    eprintln!("Computing mean over {} images ...", ds.len());
    let mean = ds.channel_mean()?;
    let formatted: Vec<String> = mean.iter().map(|m| m.to_string()).collect();
    println!("[{}]", formatted.join(", "));
    Ok(())
}
