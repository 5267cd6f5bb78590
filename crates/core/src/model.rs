//! AlexNet variant: five conv stages, three fully-connected layers.
//!
//! Batch normalisation replaces local response normalisation after each
//! pooling stage; the first one is [`BatchStats`], which also reports its
//! affine parameters. In eval mode the hidden fc outputs are scaled by
//! `eval_scale` instead of being dropped out.

use candle_core::{Result, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Dropout, Linear, Module, VarBuilder};

use alexnet_common::{AlexNetConfig, Mode};

use crate::norm::{BatchStats, ModeBatchNorm};

/// Logits plus the first normalisation layer's parameters.
pub struct ForwardOutput {
    /// `(B, num_classes)`, pre-softmax.
    pub logits: Tensor,
    pub bn_beta: Tensor,
    pub bn_gamma: Tensor,
}

fn conv(
    in_c: usize,
    out_c: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding,
        stride,
        ..Default::default()
    };
    conv2d(in_c, out_c, kernel, cfg, vb)
}

// ── AlexNet ─────────────────────────────────────────────────────────────────

pub struct AlexNet {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    conv4: Conv2d,
    conv5: Conv2d,
    bn1: BatchStats,
    bn2: ModeBatchNorm,
    bn3: ModeBatchNorm,
    fc1: Linear,
    fc2: Linear,
    fc3: Linear,
    dropout: Dropout,
    config: AlexNetConfig,
}

impl AlexNet {
    pub fn new(vb: VarBuilder, config: &AlexNetConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let [c1, c2, c3, c4, c5] = config.conv_channels;
        let flat = config
            .flattened_features()
            .ok_or_else(|| candle_core::Error::Msg("input too small".into()))?;

        Ok(Self {
            conv1: conv(config.in_channels, c1, 11, 4, 0, vb.pp("conv1"))?,
            conv2: conv(c1, c2, 5, 1, 2, vb.pp("conv2"))?,
            conv3: conv(c2, c3, 3, 1, 1, vb.pp("conv3"))?,
            conv4: conv(c3, c4, 3, 1, 1, vb.pp("conv4"))?,
            conv5: conv(c4, c5, 3, 1, 1, vb.pp("conv5"))?,
            bn1: BatchStats::new(c1, config, vb.pp("bn1"))?,
            bn2: ModeBatchNorm::new(c2, config, vb.pp("bn2"))?,
            bn3: ModeBatchNorm::new(c5, config, vb.pp("bn3"))?,
            fc1: linear(flat, config.fc_hidden, vb.pp("fc1"))?,
            fc2: linear(config.fc_hidden, config.fc_hidden, vb.pp("fc2"))?,
            fc3: linear(config.fc_hidden, config.num_classes, vb.pp("fc3"))?,
            dropout: Dropout::new(config.dropout),
            config: config.clone(),
        })
    }

    /// Forward an NHWC batch of mean-centred crops.
    pub fn forward(&self, images: &Tensor, mode: Mode) -> Result<ForwardOutput> {
        let x = images.permute((0, 3, 1, 2))?.contiguous()?;

        // Stage 1
        let x = self.conv1.forward(&x)?.relu()?;
        let x = x.max_pool2d_with_stride(3, 2)?;
        let stats = self.bn1.forward(&x, mode)?;

        // Stage 2
        let x = self.conv2.forward(&stats.output)?.relu()?;
        let x = x.max_pool2d_with_stride(3, 2)?;
        let x = self.bn2.forward(&x, mode)?;

        // Stages 3–5
        let x = self.conv3.forward(&x)?.relu()?;
        let x = self.conv4.forward(&x)?.relu()?;
        let x = self.conv5.forward(&x)?.relu()?;
        let x = x.max_pool2d_with_stride(3, 2)?;
        let x = self.bn3.forward(&x, mode)?;

        // Head
        let x = x.flatten_from(1)?;
        let x = self.fc1.forward(&x)?.relu()?;
        let x = self.regularise(&x, mode)?;
        let x = self.fc2.forward(&x)?.relu()?;
        let x = self.regularise(&x, mode)?;
        let logits = self.fc3.forward(&x)?;

        Ok(ForwardOutput {
            logits,
            bn_beta: stats.beta,
            bn_gamma: stats.gamma,
        })
    }

    fn regularise(&self, x: &Tensor, mode: Mode) -> Result<Tensor> {
        match mode {
            Mode::Train => self.dropout.forward(x, true),
            Mode::Eval => x.affine(self.config.eval_scale, 0.0),
        }
    }

    pub fn config(&self) -> &AlexNetConfig {
        &self.config
    }

    /// Running batch-norm statistics under their `VarMap` names.
    ///
    /// The layers keep these in private copies, so they have to be written
    /// back into the map before it is saved.
    pub fn running_stats(&self) -> Vec<(String, Tensor)> {
        vec![
            ("bn1.running_mean".into(), self.bn1.running_mean().clone()),
            ("bn1.running_var".into(), self.bn1.running_var().clone()),
            ("bn2.running_mean".into(), self.bn2.running_mean().clone()),
            ("bn2.running_var".into(), self.bn2.running_var().clone()),
            ("bn3.running_mean".into(), self.bn3.running_mean().clone()),
            ("bn3.running_var".into(), self.bn3.running_var().clone()),
        ]
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> AlexNetConfig {
        AlexNetConfig {
            num_classes: 5,
            input_size: 67,
            conv_channels: [4, 4, 4, 4, 4],
            fc_hidden: 8,
            ..Default::default()
        }
    }

    #[test]
    fn logits_shape_both_modes() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = AlexNet::new(vb, &tiny_config())?;

        let x = Tensor::randn(0f32, 50f32, (3, 67, 67, 3), &dev)?;
        let train = model.forward(&x, Mode::Train)?;
        assert_eq!(train.logits.dims(), &[3, 5]);
        assert_eq!(train.bn_gamma.dims(), &[4]);

        let eval = model.forward(&x, Mode::Eval)?;
        assert_eq!(eval.logits.dims(), &[3, 5]);
        Ok(())
    }

    #[test]
    fn eval_is_deterministic() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = AlexNet::new(vb, &tiny_config())?;

        let x = Tensor::randn(0f32, 50f32, (2, 67, 67, 3), &dev)?;
        let a = model.forward(&x, Mode::Eval)?.logits.to_vec2::<f32>()?;
        let b = model.forward(&x, Mode::Eval)?.logits.to_vec2::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn running_stats_are_named_like_the_varmap() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = AlexNet::new(vb, &tiny_config())?;
        let data = varmap.data().lock().unwrap();
        for (name, t) in model.running_stats() {
            assert!(data.contains_key(&name), "{name}");
            assert_eq!(t.dims(), &[4]);
        }
        Ok(())
    }

    #[test]
    fn rejects_invalid_config() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let config = AlexNetConfig {
            input_size: 30,
            ..tiny_config()
        };
        assert!(AlexNet::new(vb, &config).is_err());
    }
}
