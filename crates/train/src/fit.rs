//! Epoch driver: pipeline → trainer → metrics → stagnation check.

use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};

use alexnet_common::{Mode, RecordSource};

use crate::augment::{AugmentWorker, Augmenter};
use crate::metrics::{Accuracy, MetricsSink, RunningMean};
use crate::pipeline::{EpochReport, Pipeline};
use crate::trainer::Trainer;

/// Loss and accuracy of one pass.
#[derive(Debug, Clone, Copy)]
pub struct PhaseResult {
    pub loss: f64,
    /// Percent, `[0, 100]`.
    pub accuracy: f64,
    pub report: EpochReport,
}

#[derive(Debug, Clone)]
pub struct EpochSummary {
    /// 1-based.
    pub epoch: usize,
    pub train: PhaseResult,
    pub eval: Option<PhaseResult>,
    pub stagnated: bool,
    /// Rate in effect after the stagnation check.
    pub lr: f64,
    pub elapsed: Duration,
}

/// Loss and accuracy accumulated over one pass; cleared when a pass starts.
#[derive(Debug, Clone, Copy, Default)]
struct Meters {
    loss: RunningMean,
    accuracy: Accuracy,
}

impl Meters {
    fn reset(&mut self) {
        self.loss.reset();
        self.accuracy.reset();
    }

    fn add(&mut self, loss: f32, correct: usize, samples: usize) {
        self.loss.update(loss as f64, samples);
        self.accuracy.add(correct, samples);
    }

    fn result(&self, report: EpochReport) -> PhaseResult {
        PhaseResult {
            loss: self.loss.mean().unwrap_or(f64::NAN),
            accuracy: self.accuracy.percent(),
            report,
        }
    }
}

/// Owns the trainer and the augmentation pipeline across epochs.
pub struct TrainingLoop<W: AugmentWorker = Augmenter> {
    pub trainer: Trainer,
    pipeline: Pipeline<W>,
    train_meters: Meters,
    eval_meters: Meters,
    epochs_done: usize,
    show_progress: bool,
}

impl TrainingLoop<Augmenter> {
    /// Multi-crop augmentation with the trainer's crop size and mean.
    pub fn new(trainer: Trainer) -> anyhow::Result<Self> {
        let cfg = &trainer.config;
        let worker = Augmenter::new(cfg.crop_size, &cfg.channel_mean, cfg.seed)?;
        Ok(Self::with_worker(trainer, worker))
    }
}

impl<W: AugmentWorker> TrainingLoop<W> {
    pub fn with_worker(trainer: Trainer, worker: W) -> Self {
        let pipeline = Pipeline::new(worker, trainer.config.batch_size, trainer.config.seed);
        Self {
            trainer,
            pipeline,
            train_meters: Meters::default(),
            eval_meters: Meters::default(),
            epochs_done: 0,
            show_progress: false,
        }
    }

    /// Draw per-phase progress bars on stderr.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Continue numbering after `epochs` already completed (resume).
    pub fn set_epochs_done(&mut self, epochs: usize) {
        self.epochs_done = epochs;
    }

    pub fn epochs_done(&self) -> usize {
        self.epochs_done
    }

    fn progress_bar(&self, len: usize, phase: &str) -> anyhow::Result<ProgressBar> {
        if !self.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {prefix} {bar:40} {pos}/{len} batches {msg}")?
                .progress_chars("=>-"),
        );
        pb.set_prefix(format!("epoch {} {phase}", self.epochs_done + 1));
        Ok(pb)
    }

    /// One training pass in `Train` mode.
    pub fn train_pass(&mut self, source: &dyn RecordSource) -> anyhow::Result<PhaseResult> {
        let raw_batch_size = self.trainer.config.raw_batch_size;
        let log_every = self.trainer.config.log_every;
        let shuffle_seed = self.trainer.config.seed.wrapping_add(self.epochs_done as u64);
        let pb = self.progress_bar(source.num_batches(raw_batch_size), Mode::Train.as_str())?;

        let meters = &mut self.train_meters;
        meters.reset();
        let trainer = &mut self.trainer;
        let batches = source
            .raw_batches(raw_batch_size, Some(shuffle_seed))
            .inspect(|_| pb.inc(1));
        let report = self.pipeline.run(batches, Mode::Train, |mb| {
            let m = trainer.train_step(&mb)?;
            meters.add(m.loss, m.correct, m.samples);
            if log_every > 0 && m.step % log_every == 0 {
                tracing::info!(step = m.step, loss = m.loss, lr = m.lr, "train step");
                pb.set_message(format!("loss {:.4}", m.loss));
            }
            Ok(())
        })?;
        pb.finish_and_clear();
        Ok(self.train_meters.result(report))
    }

    /// One evaluation pass in `Eval` mode. Parameters are not touched.
    pub fn eval_pass(&mut self, source: &dyn RecordSource) -> anyhow::Result<PhaseResult> {
        let raw_batch_size = self.trainer.config.raw_batch_size;
        let pb = self.progress_bar(source.num_batches(raw_batch_size), Mode::Eval.as_str())?;

        let meters = &mut self.eval_meters;
        meters.reset();
        let trainer = &self.trainer;
        let batches = source.raw_batches(raw_batch_size, None).inspect(|_| pb.inc(1));
        let report = self.pipeline.run(batches, Mode::Eval, |mb| {
            let m = trainer.eval_step(&mb)?;
            meters.add(m.loss, m.correct, m.samples);
            Ok(())
        })?;
        pb.finish_and_clear();
        Ok(self.eval_meters.result(report))
    }

    /// Train, evaluate, record, and react to stagnation for one epoch.
    pub fn run_epoch(
        &mut self,
        train: &dyn RecordSource,
        eval: Option<&dyn RecordSource>,
        sink: &mut dyn MetricsSink,
    ) -> anyhow::Result<EpochSummary> {
        let start = Instant::now();
        let epoch = self.epochs_done + 1;

        let train_result = self.train_pass(train)?;
        sink.record("train", "loss", train_result.loss, epoch)?;
        sink.record("train", "accuracy", train_result.accuracy, epoch)?;

        let mut stagnated = false;
        let eval_result = match eval {
            Some(source) => {
                let result = self.eval_pass(source)?;
                sink.record("eval", "loss", result.loss, epoch)?;
                sink.record("eval", "accuracy", result.accuracy, epoch)?;
                stagnated = self.trainer.observe_eval_accuracy(result.accuracy);
                Some(result)
            }
            None => None,
        };
        sink.flush()?;
        self.epochs_done = epoch;

        let summary = EpochSummary {
            epoch,
            train: train_result,
            eval: eval_result,
            stagnated,
            lr: self.trainer.current_lr(),
            elapsed: start.elapsed(),
        };
        tracing::info!(
            epoch,
            train_loss = summary.train.loss,
            train_accuracy = summary.train.accuracy,
            eval_loss = summary.eval.map(|r| r.loss),
            eval_accuracy = summary.eval.map(|r| r.accuracy),
            lr = summary.lr,
            secs = summary.elapsed.as_secs_f64(),
            "Epoch done"
        );
        Ok(summary)
    }

    /// Run the configured number of epochs, checkpointing every
    /// `save_every`, then write the final model.
    pub fn fit(
        &mut self,
        train: &dyn RecordSource,
        eval: Option<&dyn RecordSource>,
        sink: &mut dyn MetricsSink,
    ) -> anyhow::Result<Vec<EpochSummary>> {
        if train.is_empty() {
            anyhow::bail!("training source is empty");
        }
        let target = self.trainer.config.epochs;
        let save_every = self.trainer.config.save_every;
        tracing::info!(
            samples = train.len(),
            eval_samples = eval.map(|e| e.len()),
            from_epoch = self.epochs_done + 1,
            to_epoch = target,
            "Training"
        );

        let mut summaries = Vec::new();
        while self.epochs_done < target {
            let summary = self.run_epoch(train, eval, sink)?;
            if save_every > 0 && summary.epoch % save_every == 0 {
                let path = self.trainer.save_checkpoint(summary.epoch)?;
                tracing::info!(path = %path.display(), "Saved checkpoint");
            }
            summaries.push(summary);
        }

        let path = self.trainer.save_final()?;
        tracing::info!(path = %path.display(), "Training done");
        Ok(summaries)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
