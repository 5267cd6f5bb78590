//! Error type shared by every crate in the workspace.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A hyper-parameter or config field is out of range. Fatal at setup.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An image cannot satisfy a required crop. No best-effort cropping.
    #[error("image of {height}x{width} is smaller than the {crop}x{crop} crop")]
    ImageTooSmall {
        height: usize,
        width: usize,
        crop: usize,
    },

    #[error("image has {found} channels but the mean vector has {expected}")]
    ChannelMismatch { expected: usize, found: usize },

    #[error("batch has {images} images but {labels} labels")]
    LabelCountMismatch { images: usize, labels: usize },

    /// Class shard directories must be named by their 1-indexed class id.
    #[error("invalid class directory {0:?}: expected a 1-indexed class id")]
    InvalidLabel(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}
