//! Epoch accumulators and scalar sinks.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use candle_core::{DType, Tensor};

// ── Accumulators ────────────────────────────────────────────────────────────

/// Sample-weighted running mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    pub fn update(&mut self, value: f64, weight: usize) {
        self.sum += value * weight as f64;
        self.count += weight;
    }

    /// `None` until something was recorded.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Top-1 accuracy over a stream of mini-batches.
#[derive(Debug, Clone, Copy, Default)]
pub struct Accuracy {
    correct: usize,
    total: usize,
}

impl Accuracy {
    pub fn add(&mut self, correct: usize, total: usize) {
        self.correct += correct;
        self.total += total;
    }

    /// Fraction in `[0, 1]`; 0 when nothing was seen.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn percent(&self) -> f64 {
        100.0 * self.fraction()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Number of rows of `logits` whose argmax equals the label.
pub fn count_correct(logits: &Tensor, labels: &[u32]) -> candle_core::Result<usize> {
    let predicted = logits.argmax(1)?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    Ok(predicted.iter().zip(labels).filter(|(p, l)| p == l).count())
}

// ── Sinks ───────────────────────────────────────────────────────────────────

/// Destination for per-epoch scalars such as `("train", "loss")`.
pub trait MetricsSink {
    fn record(&mut self, split: &str, name: &str, value: f64, step: usize) -> anyhow::Result<()>;

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Appends `split,metric,step,value` rows to a CSV file.
pub struct CsvMetricsSink {
    out: BufWriter<File>,
}

impl CsvMetricsSink {
    /// Create (truncating) `path` and write the header row.
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "split,metric,step,value")?;
        Ok(Self { out })
    }
}

impl MetricsSink for CsvMetricsSink {
    fn record(&mut self, split: &str, name: &str, value: f64, step: usize) -> anyhow::Result<()> {
        tracing::info!(split, metric = name, step, value, "metric");
        writeln!(self.out, "{split},{name},{step},{value}")?;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// One recorded scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub split: String,
    pub name: String,
    pub value: f64,
    pub step: usize,
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<Record>,
}

impl MemorySink {
    /// All values of `split/name` in recording order.
    pub fn series(&self, split: &str, name: &str) -> Vec<(usize, f64)> {
        self.records
            .iter()
            .filter(|r| r.split == split && r.name == name)
            .map(|r| (r.step, r.value))
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn record(&mut self, split: &str, name: &str, value: f64, step: usize) -> anyhow::Result<()> {
        tracing::debug!(split, metric = name, step, value, "metric");
        self.records.push(Record {
            split: split.to_string(),
            name: name.to_string(),
            value,
            step,
        });
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
