//! Double-buffered augmentation pipeline.
//!
//! While the consumer works through the mini-batches of augmented batch *k*,
//! a scoped background thread augments raw batch *k + 1* and posts it into a
//! single-item slot. The two sides meet at the join before the next round.
//!
//! ```text
//! prime:   augment(raw₀) ───────────────► slot
//! steady:  slot ► consume(aug₀)  ‖  augment(raw₁) ► slot      (join)
//!          slot ► consume(aug₁)  ‖  augment(raw₂) ► slot      (join)
//! drain:   slot ► consume(aug_last)
//! ```

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;

use alexnet_common::{Mode, RawBatch};

use crate::augment::{AugmentWorker, AugmentedBatch, MiniBatch};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline slot already holds an augmented batch")]
    SlotOccupied,
    #[error("pipeline slot is empty")]
    SlotEmpty,
    #[error("augmentation worker panicked")]
    WorkerPanicked,
}

// ── Slot ────────────────────────────────────────────────────────────────────

/// Single-item handoff buffer between the worker and the consumer.
#[derive(Default)]
pub struct Slot {
    inner: Mutex<Option<AugmentedBatch>>,
}

impl Slot {
    pub fn post(&self, batch: AugmentedBatch) -> Result<(), PipelineError> {
        let mut guard = self.inner.lock();
        if guard.is_some() {
            return Err(PipelineError::SlotOccupied);
        }
        *guard = Some(batch);
        Ok(())
    }

    pub fn take(&self) -> Result<AugmentedBatch, PipelineError> {
        self.inner.lock().take().ok_or(PipelineError::SlotEmpty)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_none()
    }
}

// ── Report ──────────────────────────────────────────────────────────────────

/// Counters for one pass over a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochReport {
    pub raw_batches: usize,
    pub augment_runs: usize,
    pub mini_batches: usize,
    /// Augmented samples that did not fill a whole mini-batch.
    pub dropped_samples: usize,
}

// ── Pipeline ────────────────────────────────────────────────────────────────

pub struct Pipeline<W: AugmentWorker> {
    worker: W,
    slot: Slot,
    batch_size: usize,
    rng: StdRng,
}

impl<W: AugmentWorker> Pipeline<W> {
    /// `seed` drives the per-batch reshuffle.
    pub fn new(worker: W, batch_size: usize, seed: u64) -> Self {
        Self {
            worker,
            slot: Slot::default(),
            batch_size,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    pub fn worker_mut(&mut self) -> &mut W {
        &mut self.worker
    }

    /// Run one pass: augment every raw batch exactly once and hand every
    /// resulting mini-batch to `consume`.
    ///
    /// A consumer error wins over a worker error from the same round; the
    /// background thread is always joined first.
    pub fn run<I, F>(&mut self, source: I, mode: Mode, mut consume: F) -> anyhow::Result<EpochReport>
    where
        I: IntoIterator<Item = anyhow::Result<RawBatch>>,
        F: FnMut(MiniBatch) -> anyhow::Result<()>,
    {
        let mut report = EpochReport::default();
        // A failed round may leave a batch behind.
        let _ = self.slot.take();
        let mut source = source.into_iter();

        // Prime
        let Some(first) = source.next() else {
            return Ok(report);
        };
        let first = first?;
        report.raw_batches += 1;
        let augmented = self.worker.augment(first, mode)?;
        report.augment_runs += 1;
        self.slot.post(augmented)?;

        // Steady state
        for raw in source {
            let raw = raw?;
            report.raw_batches += 1;

            let current = self.slot.take()?;

            let worker = &mut self.worker;
            let slot = &self.slot;
            let rng = &mut self.rng;
            let batch_size = self.batch_size;
            let (consumed, joined) = std::thread::scope(|s| {
                let handle = s.spawn(move || -> anyhow::Result<()> {
                    let augmented = worker.augment(raw, mode)?;
                    slot.post(augmented)?;
                    Ok(())
                });
                // Split while the worker runs.
                let consumed = split(current, batch_size, rng, &mut report)
                    .and_then(|minis| minis.into_iter().try_for_each(&mut consume));
                (consumed, handle.join())
            });

            consumed?;
            joined.map_err(|_| PipelineError::WorkerPanicked)??;
            report.augment_runs += 1;
            tracing::trace!(raw = report.raw_batches, "augmentation round joined");
        }

        // Drain
        let last = self.slot.take()?;
        let minis = split(last, self.batch_size, &mut self.rng, &mut report)?;
        minis.into_iter().try_for_each(&mut consume)?;

        Ok(report)
    }
}

/// Reshuffle and cut one augmented batch, counting what was kept and dropped.
fn split(
    batch: AugmentedBatch,
    batch_size: usize,
    rng: &mut StdRng,
    report: &mut EpochReport,
) -> anyhow::Result<Vec<MiniBatch>> {
    let total = batch.len();
    let minis = batch.into_mini_batches(batch_size, rng)?;
    let used = minis.len() * batch_size;
    report.mini_batches += minis.len();
    report.dropped_samples += total - used;
    Ok(minis)
}

// ── Tests ───────────────────────────────────────────────────────────────────
