//! # alexnet-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`AlexNetConfig`]** — model hyper-parameters (serialised as JSON).
//! * **[`Mode`]** — the explicit train / eval switch.
//! * **[`RawBatch`]** / **[`RecordSource`]** — decoded image batches and the
//!   readers that produce them.
//! * **[`Error`]** — typed errors (`InvalidConfiguration`, `ImageTooSmall`, …).

pub mod config;
pub mod data;
pub mod error;

pub use config::{AlexNetConfig, IMAGENET_MEAN};
pub use data::{decode_image, ImageFolderDataset, Mode, RawBatch, RecordSource, TensorDataset};
pub use error::{Error, Result};
