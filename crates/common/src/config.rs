//! Model configuration for the AlexNet variant.
//!
//! Serialised as JSON next to every checkpoint. Every field has a default so
//! a minimal `{}` JSON yields the ImageNet-sized network.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Per-channel RGB mean of the ILSVRC2012 training set.
///
/// Computed once offline (see the `compute-mean` command); never recomputed
/// during training.
pub const IMAGENET_MEAN: [f32; 3] = [122.10927936917298, 116.5416959998387, 102.61744377213829];

/// Configuration for the convolutional classifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlexNetConfig {
    // ── Input / output ──────────────────────────────────────────────────────
    /// Number of target classes.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Spatial size of the square network input (the crop size).
    #[serde(default = "default_input_size")]
    pub input_size: usize,
    /// Input channels (RGB).
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,

    // ── Widths ──────────────────────────────────────────────────────────────
    /// Output channels of conv1..conv5.
    #[serde(default = "default_conv_channels")]
    pub conv_channels: [usize; 5],
    /// Width of the two hidden fully-connected layers.
    #[serde(default = "default_fc_hidden")]
    pub fc_hidden: usize,

    // ── Regularisation ──────────────────────────────────────────────────────
    /// Dropout probability after each hidden fc layer (train mode only).
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    /// Output scaling applied instead of dropout in eval mode.
    #[serde(default = "default_eval_scale")]
    pub eval_scale: f64,

    // ── Batch statistics ────────────────────────────────────────────────────
    #[serde(default = "default_bn_eps")]
    pub bn_eps: f64,
    /// Weight of the current batch in the running statistics update.
    #[serde(default = "default_bn_momentum")]
    pub bn_momentum: f64,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_num_classes() -> usize {
    1000
}
fn default_input_size() -> usize {
    227
}
fn default_in_channels() -> usize {
    3
}
fn default_conv_channels() -> [usize; 5] {
    [96, 256, 384, 384, 256]
}
fn default_fc_hidden() -> usize {
    4096
}
fn default_dropout() -> f32 {
    0.2
}
fn default_eval_scale() -> f64 {
    0.8
}
fn default_bn_eps() -> f64 {
    1e-3
}
fn default_bn_momentum() -> f64 {
    0.01
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for AlexNetConfig {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            input_size: default_input_size(),
            in_channels: default_in_channels(),
            conv_channels: default_conv_channels(),
            fc_hidden: default_fc_hidden(),
            dropout: default_dropout(),
            eval_scale: default_eval_scale(),
            bn_eps: default_bn_eps(),
            bn_momentum: default_bn_momentum(),
        }
    }
}

impl AlexNetConfig {
    /// Spatial size of the last feature map, or `None` when the input is too
    /// small to survive conv1 (11×11 stride 4) and the three 3×3/2 pools.
    pub fn feature_map_size(&self) -> Option<usize> {
        let conv1 = self.input_size.checked_sub(11)? / 4 + 1;
        let mut size = conv1;
        for _ in 0..3 {
            size = size.checked_sub(3)? / 2 + 1;
        }
        Some(size)
    }

    /// Number of features entering the first fully-connected layer.
    pub fn flattened_features(&self) -> Option<usize> {
        let s = self.feature_map_size()?;
        Some(self.conv_channels[4] * s * s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::invalid_config("num_classes must be > 0"));
        }
        if self.feature_map_size().is_none() {
            return Err(Error::invalid_config(format!(
                "input_size {} is too small for the conv/pool stack",
                self.input_size
            )));
        }
        if self.conv_channels.iter().any(|&c| c == 0) || self.fc_hidden == 0 {
            return Err(Error::invalid_config("layer widths must be > 0"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::invalid_config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if !(0.0..=1.0).contains(&self.bn_momentum) {
            return Err(Error::invalid_config(format!(
                "bn_momentum must be in [0, 1], got {}",
                self.bn_momentum
            )));
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
