//! Normalisation layers over NCHW feature maps.
//!
//! [`BatchStats`] is the custom layer after the first pooling stage: it
//! normalises with the batch's own statistics in train mode and with running
//! statistics in eval mode, and hands its affine parameters back to the
//! caller so they can be monitored.

use candle_core::{Result, Tensor, Var, D};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, Init, ModuleT, VarBuilder};

use alexnet_common::{AlexNetConfig, Mode};

/// Output of [`BatchStats::forward`].
pub struct BatchStatsOutput {
    pub output: Tensor,
    /// Shift parameter, shape `(C,)`.
    pub beta: Tensor,
    /// Scale parameter, shape `(C,)`.
    pub gamma: Tensor,
}

/// Batch normalisation that exposes `beta` and `gamma`.
pub struct BatchStats {
    gamma: Tensor,
    beta: Tensor,
    running_mean: Var,
    running_var: Var,
    eps: f64,
    momentum: f64,
    num_features: usize,
}

impl BatchStats {
    pub fn new(num_features: usize, config: &AlexNetConfig, vb: VarBuilder) -> Result<Self> {
        let gamma = vb.get_with_hints(num_features, "weight", Init::Const(1.))?;
        let beta = vb.get_with_hints(num_features, "bias", Init::Const(0.))?;
        let running_mean = vb.get_with_hints(num_features, "running_mean", Init::Const(0.))?;
        let running_var = vb.get_with_hints(num_features, "running_var", Init::Const(1.))?;
        Ok(Self {
            gamma,
            beta,
            running_mean: Var::from_tensor(&running_mean)?,
            running_var: Var::from_tensor(&running_var)?,
            eps: config.bn_eps,
            momentum: config.bn_momentum,
            num_features,
        })
    }

    pub fn forward(&self, x: &Tensor, mode: Mode) -> Result<BatchStatsOutput> {
        let c = self.num_features;
        let (mean, var) = match mode {
            Mode::Train => {
                let mean = channel_mean(x)?;
                let var = channel_mean(&x.broadcast_sub(&mean.reshape((1, c, 1, 1))?)?.sqr()?)?;
                self.update_running(&mean, &var)?;
                (mean, var)
            }
            Mode::Eval => (
                self.running_mean.as_tensor().clone(),
                self.running_var.as_tensor().clone(),
            ),
        };

        let mean = mean.reshape((1, c, 1, 1))?;
        let std = var.affine(1.0, self.eps)?.sqrt()?.reshape((1, c, 1, 1))?;
        let normed = x.broadcast_sub(&mean)?.broadcast_div(&std)?;
        let output = normed
            .broadcast_mul(&self.gamma.reshape((1, c, 1, 1))?)?
            .broadcast_add(&self.beta.reshape((1, c, 1, 1))?)?;

        Ok(BatchStatsOutput {
            output,
            beta: self.beta.clone(),
            gamma: self.gamma.clone(),
        })
    }

    fn update_running(&self, mean: &Tensor, var: &Tensor) -> Result<()> {
        let m = self.momentum;
        let next_mean = (self.running_mean.affine(1.0 - m, 0.0)? + mean.affine(m, 0.0)?)?;
        let next_var = (self.running_var.affine(1.0 - m, 0.0)? + var.affine(m, 0.0)?)?;
        self.running_mean.set(&next_mean)?;
        self.running_var.set(&next_var)
    }

    pub fn running_mean(&self) -> &Tensor {
        self.running_mean.as_tensor()
    }

    pub fn running_var(&self) -> &Tensor {
        self.running_var.as_tensor()
    }
}

/// Mean over batch and spatial dims of an NCHW tensor → `(C,)`.
fn channel_mean(x: &Tensor) -> Result<Tensor> {
    x.mean_keepdim(D::Minus1)?
        .mean_keepdim(D::Minus2)?
        .mean_keepdim(0)?
        .flatten_all()
}

// ── Plain batch norm ────────────────────────────────────────────────────────

/// Stock batch norm for the later stages, switched by [`Mode`].
pub struct ModeBatchNorm(BatchNorm);

impl ModeBatchNorm {
    pub fn new(num_features: usize, config: &AlexNetConfig, vb: VarBuilder) -> Result<Self> {
        let bn_config = BatchNormConfig {
            eps: config.bn_eps,
            momentum: config.bn_momentum,
            ..Default::default()
        };
        Ok(Self(batch_norm(num_features, bn_config, vb)?))
    }

    pub fn forward(&self, x: &Tensor, mode: Mode) -> Result<Tensor> {
        self.0.forward_t(x, mode.is_train())
    }

    pub fn running_mean(&self) -> &Tensor {
        self.0.running_mean()
    }

    pub fn running_var(&self) -> &Tensor {
        self.0.running_var()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> AlexNetConfig {
        AlexNetConfig {
            bn_momentum: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn train_mode_normalises_per_channel() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let layer = BatchStats::new(2, &small_config(), vb)?;

        let x = Tensor::randn(5f32, 3f32, (4, 2, 3, 3), &dev)?;
        let out = layer.forward(&x, Mode::Train)?;
        assert_eq!(out.output.dims(), &[4, 2, 3, 3]);
        assert_eq!(out.beta.dims(), &[2]);
        assert_eq!(out.gamma.to_vec1::<f32>()?, vec![1.0, 1.0]);

        let means = channel_mean(&out.output)?.to_vec1::<f32>()?;
        for m in means {
            assert!(m.abs() < 1e-4, "channel mean {m}");
        }
        Ok(())
    }

    #[test]
    fn train_mode_moves_running_mean() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let layer = BatchStats::new(1, &small_config(), vb)?;

        let x = Tensor::full(4f32, (2, 1, 2, 2), &dev)?;
        layer.forward(&x, Mode::Train)?;
        // 0.5 * 0 + 0.5 * 4
        let rm = layer.running_mean().to_vec1::<f32>()?;
        assert!((rm[0] - 2.0).abs() < 1e-6);

        // Eval does not touch the running statistics.
        layer.forward(&x, Mode::Eval)?;
        let rm = layer.running_mean().to_vec1::<f32>()?;
        assert!((rm[0] - 2.0).abs() < 1e-6);
        Ok(())
    }
}
