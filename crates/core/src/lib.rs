//! # alexnet-core — The Model
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`norm`] | `BatchStats` (batch statistics + exposed β/γ), `ModeBatchNorm` |
//! | [`model`] | `AlexNet`, `ForwardOutput` |
//!
//! Everything is a composition of `candle-nn` layers; train vs. eval
//! behaviour is chosen by an explicit [`Mode`](alexnet_common::Mode).

pub mod model;
pub mod norm;

pub use model::{AlexNet, ForwardOutput};
pub use norm::{BatchStats, BatchStatsOutput, ModeBatchNorm};
