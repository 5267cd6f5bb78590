//! # alexnet-train — Optimisation and the Input Pipeline
//!
//! * **[`AlexSgd`]** — momentum SGD with coupled weight decay, driven
//!   through `candle_nn::Optimizer`.
//! * **[`LrSchedule`]** — constant rate, lowered on every stagnation event
//!   raised by the [`StagnationDetector`].
//! * **[`Augmenter`]** — 2-crop (train) / 10-crop (eval) augmentation with
//!   mean subtraction.
//! * **[`Pipeline`]** — double-buffered augmentation: the next raw batch is
//!   augmented on a scoped thread while the current one is consumed.
//! * **[`Trainer`]** / **[`TrainingLoop`]** — per-step and per-epoch drivers,
//!   metrics sinks, checkpoints.

pub mod augment;
pub mod fit;
pub mod metrics;
pub mod optimizer;
pub mod pipeline;
pub mod scheduler;
pub mod trainer;

pub use augment::{variants_per_image, AugmentWorker, AugmentedBatch, Augmenter, MiniBatch};
pub use fit::{EpochSummary, PhaseResult, TrainingLoop};
pub use metrics::{Accuracy, CsvMetricsSink, MemorySink, MetricsSink, RunningMean};
pub use optimizer::{AlexSgd, ParamsAlexSgd};
pub use pipeline::{EpochReport, Pipeline, PipelineError, Slot};
pub use scheduler::{LrSchedule, ScheduleState, StagnationDecay, StagnationDetector};
pub use trainer::{StepMetrics, Trainer, TrainerConfig};
