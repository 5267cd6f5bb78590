//! Trainer: owns the model, the optimiser and the learning-rate schedule.
//!
//! One call to [`Trainer::train_step`] runs forward, cross-entropy,
//! backward and an [`AlexSgd`] step at the schedule's current rate.
//! [`Trainer::signal_stagnation`] is the only thing that moves the rate.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{loss, Optimizer, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use alexnet_common::{AlexNetConfig, Error, Mode, IMAGENET_MEAN};
use alexnet_core::AlexNet;

use crate::augment::MiniBatch;
use crate::metrics::count_correct;
use crate::optimizer::{AlexSgd, ParamsAlexSgd};
use crate::scheduler::{LrSchedule, ScheduleState, StagnationDecay, StagnationDetector};

// ── Config ──────────────────────────────────────────────────────────────────

fn default_batch_size() -> usize {
    128
}
fn default_raw_batch_size() -> usize {
    128
}
fn default_epochs() -> usize {
    90
}
fn default_lr() -> f64 {
    0.02
}
fn default_momentum() -> f64 {
    0.9
}
fn default_weight_decay() -> f64 {
    5e-4
}
fn default_crop_size() -> usize {
    227
}
fn default_image_size() -> Option<u32> {
    Some(256)
}
fn default_channel_mean() -> Vec<f32> {
    IMAGENET_MEAN.to_vec()
}
fn default_save_every() -> usize {
    1
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

/// All training hyper-parameters. Saved next to every checkpoint as
/// `train_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Mini-batch size for gradient steps.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Images per raw batch handed to the augmentation worker.
    #[serde(default = "default_raw_batch_size")]
    pub raw_batch_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// Floor for the decayed rate.
    #[serde(default)]
    pub lr_min: f64,
    #[serde(default)]
    pub lr_decay: StagnationDecay,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default)]
    pub nesterov: bool,
    #[serde(default = "default_crop_size")]
    pub crop_size: usize,
    /// Square resize applied at decode time; `None` keeps source size.
    #[serde(default = "default_image_size")]
    pub image_size: Option<u32>,
    #[serde(default = "default_channel_mean")]
    pub channel_mean: Vec<f32>,
    /// Checkpoint every N epochs; 0 disables intermediate checkpoints.
    #[serde(default = "default_save_every")]
    pub save_every: usize,
    /// Log train loss every N steps; 0 disables.
    #[serde(default)]
    pub log_every: usize,
    /// Log batch-norm β/γ summaries every N steps; 0 disables.
    #[serde(default)]
    pub debug_every: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            raw_batch_size: default_raw_batch_size(),
            epochs: default_epochs(),
            lr: default_lr(),
            lr_min: 0.0,
            lr_decay: StagnationDecay::default(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            nesterov: false,
            crop_size: default_crop_size(),
            image_size: default_image_size(),
            channel_mean: default_channel_mean(),
            save_every: default_save_every(),
            log_every: 0,
            debug_every: 0,
            seed: 0,
            output_dir: default_output_dir(),
        }
    }
}

impl TrainerConfig {
    pub fn optimizer_params(&self) -> ParamsAlexSgd {
        ParamsAlexSgd {
            lr: self.lr,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            nesterov: self.nesterov,
        }
    }

    pub fn validate(&self) -> alexnet_common::Result<()> {
        if self.batch_size == 0 {
            return Err(Error::invalid_config("batch_size must be > 0"));
        }
        if self.raw_batch_size == 0 {
            return Err(Error::invalid_config("raw_batch_size must be > 0"));
        }
        if self.crop_size == 0 {
            return Err(Error::invalid_config("crop_size must be > 0"));
        }
        if let Some(size) = self.image_size {
            if (size as usize) < self.crop_size {
                return Err(Error::invalid_config(format!(
                    "image_size {size} is smaller than crop_size {}",
                    self.crop_size
                )));
            }
        }
        if self.channel_mean.is_empty() {
            return Err(Error::invalid_config("channel_mean must not be empty"));
        }
        self.optimizer_params().validate()?;
        LrSchedule::new(self.lr, self.lr_min, self.lr_decay)?;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> alexnet_common::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> alexnet_common::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// Metrics returned after each train or eval step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub correct: usize,
    pub samples: usize,
    pub lr: f64,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimiser, and schedule.
pub struct Trainer {
    pub model: AlexNet,
    pub varmap: VarMap,
    optimizer: AlexSgd,
    schedule: LrSchedule,
    detector: StagnationDetector,
    pub config: TrainerConfig,
    model_config: AlexNetConfig,
    pub global_step: usize,
    device: Device,
}

impl Trainer {
    /// Construct a new Trainer. Builds the model from config.
    pub fn new(
        model_config: AlexNetConfig,
        trainer_config: TrainerConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        trainer_config.validate()?;
        if model_config.input_size != trainer_config.crop_size {
            return Err(Error::invalid_config(format!(
                "model input_size {} differs from crop_size {}",
                model_config.input_size, trainer_config.crop_size
            ))
            .into());
        }
        if model_config.in_channels != trainer_config.channel_mean.len() {
            return Err(Error::ChannelMismatch {
                expected: model_config.in_channels,
                found: trainer_config.channel_mean.len(),
            }
            .into());
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = AlexNet::new(vb, &model_config)?;
        let vars = varmap.all_vars();
        let num_params: usize = vars.iter().map(|v| v.elem_count()).sum();
        tracing::info!(
            tensors = vars.len(),
            params = num_params,
            input = model_config.input_size,
            classes = model_config.num_classes,
            "Model built"
        );

        let schedule = LrSchedule::new(
            trainer_config.lr,
            trainer_config.lr_min,
            trainer_config.lr_decay,
        )?;
        let optimizer = AlexSgd::try_new(vars, trainer_config.optimizer_params())?;

        Ok(Self {
            model,
            varmap,
            optimizer,
            schedule,
            detector: StagnationDetector::default(),
            config: trainer_config,
            model_config,
            global_step: 0,
            device,
        })
    }

    fn batch_tensors(&self, batch: &MiniBatch) -> candle_core::Result<(Tensor, Tensor)> {
        let images = batch.images.to_device(&self.device)?;
        let labels = Tensor::new(batch.labels.as_slice(), &self.device)?;
        Ok((images, labels))
    }

    /// One optimiser step on a mini-batch.
    pub fn train_step(&mut self, batch: &MiniBatch) -> anyhow::Result<StepMetrics> {
        let (images, labels) = self.batch_tensors(batch)?;
        let out = self.model.forward(&images, Mode::Train)?;
        let step_loss = loss::cross_entropy(&out.logits, &labels)?;

        let lr = self.schedule.current_rate();
        self.optimizer.set_learning_rate(lr);
        self.optimizer.backward_step(&step_loss)?;

        let step = self.global_step;
        self.global_step += 1;

        if self.config.debug_every > 0 && step % self.config.debug_every == 0 {
            tracing::debug!(
                step,
                bn1_beta_mean = out.bn_beta.mean_all()?.to_scalar::<f32>()?,
                bn1_gamma_mean = out.bn_gamma.mean_all()?.to_scalar::<f32>()?,
                "bn1 parameters"
            );
        }

        Ok(StepMetrics {
            step,
            loss: step_loss.to_scalar::<f32>()?,
            correct: count_correct(&out.logits, &batch.labels)?,
            samples: batch.labels.len(),
            lr,
        })
    }

    /// Loss and hit count without touching parameters.
    pub fn eval_step(&self, batch: &MiniBatch) -> anyhow::Result<StepMetrics> {
        let (images, labels) = self.batch_tensors(batch)?;
        let out = self.model.forward(&images, Mode::Eval)?;
        let step_loss = loss::cross_entropy(&out.logits, &labels)?;
        Ok(StepMetrics {
            step: self.global_step,
            loss: step_loss.to_scalar::<f32>()?,
            correct: count_correct(&out.logits, &batch.labels)?,
            samples: batch.labels.len(),
            lr: self.schedule.current_rate(),
        })
    }

    /// Eval accuracy did not improve: lower the rate. Returns the new rate.
    pub fn signal_stagnation(&mut self) -> f64 {
        let lr = self.schedule.on_stagnation();
        self.optimizer.set_learning_rate(lr);
        tracing::info!(
            stagnation_count = self.schedule.stagnation_count(),
            lr,
            "Learning rate lowered"
        );
        lr
    }

    /// Feed an epoch's eval accuracy. Lowers the rate and returns `true`
    /// when it did not beat the previous epoch's.
    pub fn observe_eval_accuracy(&mut self, accuracy: f64) -> bool {
        let stagnated = self.detector.observe(accuracy);
        if stagnated {
            self.signal_stagnation();
        }
        stagnated
    }

    pub fn schedule_state(&self) -> ScheduleState {
        ScheduleState {
            stagnation_count: self.schedule.stagnation_count(),
            previous_accuracy: self.detector.previous(),
            global_step: self.global_step,
        }
    }

    pub fn restore_schedule(&mut self, state: ScheduleState) {
        self.schedule.set_stagnation_count(state.stagnation_count);
        self.detector = StagnationDetector::with_previous(state.previous_accuracy);
        self.global_step = state.global_step;
        self.optimizer.set_learning_rate(self.schedule.current_rate());
    }

    pub fn current_lr(&self) -> f64 {
        self.schedule.current_rate()
    }

    pub fn schedule(&self) -> &LrSchedule {
        &self.schedule
    }

    pub fn optimizer(&self) -> &AlexSgd {
        &self.optimizer
    }

    pub fn model_config(&self) -> &AlexNetConfig {
        &self.model_config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Copy the layers' running batch-norm statistics into the var map.
    fn sync_running_stats(&mut self) -> anyhow::Result<()> {
        for (name, value) in self.model.running_stats() {
            self.varmap.set_one(&name, &value)?;
        }
        Ok(())
    }

    fn save_to(&mut self, path: &Path) -> anyhow::Result<()> {
        let dir = self.config.output_dir.clone();
        std::fs::create_dir_all(&dir)?;
        self.sync_running_stats()?;
        self.varmap.save(path)?;
        self.schedule_state().save(&schedule_state_path(path))?;
        self.model_config.save(&dir.join("config.json"))?;
        self.config.save(&dir.join("train_config.json"))?;
        Ok(())
    }

    /// Save an end-of-epoch checkpoint (`epoch` is 1-based).
    pub fn save_checkpoint(&mut self, epoch: usize) -> anyhow::Result<PathBuf> {
        let path = self
            .config
            .output_dir
            .join(format!("checkpoint-epoch-{epoch}.safetensors"));
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save final model.
    pub fn save_final(&mut self) -> anyhow::Result<PathBuf> {
        let path = self.config.output_dir.join("model.safetensors");
        self.save_to(&path)?;
        Ok(path)
    }

    /// Overwrite the current parameters with a safetensors snapshot, and
    /// the schedule with the state saved beside it when there is one.
    ///
    /// The model is rebuilt on the loaded map so the batch-norm layers pick
    /// up the stored running statistics; trainable vars keep their identity.
    pub fn load_weights(&mut self, path: &Path) -> anyhow::Result<()> {
        self.varmap.load(path)?;
        let vb = VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device);
        self.model = AlexNet::new(vb, &self.model_config)?;

        let state_path = schedule_state_path(path);
        if state_path.exists() {
            self.restore_schedule(ScheduleState::load(&state_path)?);
        } else {
            tracing::warn!(
                path = %state_path.display(),
                "No schedule state, starting at the initial rate"
            );
        }
        tracing::info!(
            path = %path.display(),
            lr = self.current_lr(),
            step = self.global_step,
            "Loaded weights"
        );
        Ok(())
    }
}

/// `checkpoint-epoch-3.safetensors` → `checkpoint-epoch-3.schedule.json`.
fn schedule_state_path(weights: &Path) -> PathBuf {
    weights.with_extension("schedule.json")
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn tiny_model() -> AlexNetConfig {
        AlexNetConfig {
            num_classes: 3,
            input_size: 67,
            conv_channels: [4, 4, 4, 4, 4],
            fc_hidden: 8,
            dropout: 0.0,
            ..Default::default()
        }
    }

    pub(crate) fn tiny_trainer_config(output_dir: &Path) -> TrainerConfig {
        TrainerConfig {
            batch_size: 2,
            raw_batch_size: 2,
            epochs: 1,
            crop_size: 67,
            image_size: Some(70),
            output_dir: output_dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn mini_batch(n: usize) -> MiniBatch {
        MiniBatch {
            images: Tensor::randn(0f32, 30f32, (n, 67, 67, 3), &Device::Cpu).unwrap(),
            labels: (0..n as u32).map(|i| i % 3).collect(),
        }
    }

    #[test]
    fn config_defaults() {
        let cfg = TrainerConfig::default();
        assert_eq!(cfg.batch_size, 128);
        assert_eq!(cfg.epochs, 90);
        assert_eq!(cfg.crop_size, 227);
        assert_eq!(cfg.image_size, Some(256));
        assert_eq!(cfg.lr_decay, StagnationDecay::Exponential { factor: 0.5 });
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_rejects_bad_values() {
        let bad = [
            TrainerConfig {
                momentum: 1.5,
                ..Default::default()
            },
            TrainerConfig {
                batch_size: 0,
                ..Default::default()
            },
            TrainerConfig {
                image_size: Some(200),
                ..Default::default()
            },
            TrainerConfig {
                lr: 0.0,
                ..Default::default()
            },
        ];
        for cfg in bad {
            assert!(cfg.validate().is_err(), "{cfg:?}");
        }
    }

    #[test]
    fn trainer_rejects_crop_model_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TrainerConfig {
            crop_size: 60,
            ..tiny_trainer_config(dir.path())
        };
        assert!(Trainer::new(tiny_model(), cfg, Device::Cpu).is_err());
    }

    #[test]
    fn train_step_updates_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer =
            Trainer::new(tiny_model(), tiny_trainer_config(dir.path()), Device::Cpu).unwrap();
        let before = trainer.varmap.data().lock().unwrap()["fc3.weight"]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        let m = trainer.train_step(&mini_batch(4)).unwrap();
        assert_eq!(m.step, 0);
        assert_eq!(m.samples, 4);
        assert!(m.loss.is_finite());
        assert!((m.lr - 0.02).abs() < 1e-12);
        assert_eq!(trainer.global_step, 1);

        let after = trainer.varmap.data().lock().unwrap()["fc3.weight"]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn eval_step_leaves_parameters_alone() {
        let dir = tempfile::tempdir().unwrap();
        let trainer =
            Trainer::new(tiny_model(), tiny_trainer_config(dir.path()), Device::Cpu).unwrap();
        let batch = mini_batch(3);
        let a = trainer.eval_step(&batch).unwrap();
        let b = trainer.eval_step(&batch).unwrap();
        assert_eq!(a.loss, b.loss);
        assert_eq!(trainer.global_step, 0);
    }

    #[test]
    fn stagnation_lowers_rate() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer =
            Trainer::new(tiny_model(), tiny_trainer_config(dir.path()), Device::Cpu).unwrap();
        let lr = trainer.signal_stagnation();
        assert!((lr - 0.01).abs() < 1e-12);
        assert_eq!(trainer.optimizer().learning_rate(), lr);
        let m = trainer.train_step(&mini_batch(2)).unwrap();
        assert!((m.lr - 0.01).abs() < 1e-12);
    }

    #[test]
    fn resume_keeps_lowered_rate() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer =
            Trainer::new(tiny_model(), tiny_trainer_config(dir.path()), Device::Cpu).unwrap();
        assert!(!trainer.observe_eval_accuracy(30.0));
        assert!(trainer.observe_eval_accuracy(30.0));
        trainer.signal_stagnation();
        trainer.train_step(&mini_batch(2)).unwrap();
        let lr = trainer.current_lr();
        assert!((lr - 0.005).abs() < 1e-12);
        let path = trainer.save_checkpoint(2).unwrap();
        assert!(dir.path().join("checkpoint-epoch-2.schedule.json").exists());

        let mut resumed =
            Trainer::new(tiny_model(), tiny_trainer_config(dir.path()), Device::Cpu).unwrap();
        resumed.load_weights(&path).unwrap();
        assert_eq!(resumed.current_lr(), lr);
        assert_eq!(resumed.optimizer().learning_rate(), lr);
        assert_eq!(resumed.global_step, 1);
        assert_eq!(resumed.schedule_state(), trainer.schedule_state());
        // The detector remembers the last accuracy too.
        assert!(resumed.observe_eval_accuracy(29.0));
        assert!((resumed.current_lr() - 0.0025).abs() < 1e-12);
    }

    #[test]
    fn checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer =
            Trainer::new(tiny_model(), tiny_trainer_config(dir.path()), Device::Cpu).unwrap();
        trainer.train_step(&mini_batch(2)).unwrap();
        let path = trainer.save_checkpoint(1).unwrap();
        assert!(path.ends_with("checkpoint-epoch-1.safetensors"));
        assert!(dir.path().join("config.json").exists());

        let saved = TrainerConfig::load(&dir.path().join("train_config.json")).unwrap();
        assert_eq!(saved, trainer.config);

        let batch = mini_batch(2);
        let expected = trainer.eval_step(&batch).unwrap().loss;
        let mut fresh =
            Trainer::new(tiny_model(), tiny_trainer_config(dir.path()), Device::Cpu).unwrap();
        fresh.load_weights(&path).unwrap();
        let got = fresh.eval_step(&batch).unwrap().loss;
        assert!((expected - got).abs() < 1e-4, "{expected} vs {got}");

        // Loaded vars are still the ones being optimised.
        fresh.train_step(&batch).unwrap();
        assert_ne!(fresh.eval_step(&batch).unwrap().loss, got);
    }

    #[test]
    fn running_stats_survive_save() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer =
            Trainer::new(tiny_model(), tiny_trainer_config(dir.path()), Device::Cpu).unwrap();
        trainer.train_step(&mini_batch(4)).unwrap();
        let live = trainer.model.running_stats()[0].1.to_vec1::<f32>().unwrap();
        assert!(live.iter().any(|&m| m != 0.0));

        let path = trainer.save_final().unwrap();
        let loaded = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        let stored = loaded["bn1.running_mean"].to_vec1::<f32>().unwrap();
        assert_eq!(live, stored);
    }
}
