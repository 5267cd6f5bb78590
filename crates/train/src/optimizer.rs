//! Momentum SGD with coupled (L2-style) weight decay.
//!
//! For every parameter `w` with gradient `g`, at learning rate `lr`:
//!
//! ```text
//! d  = weight_decay · w            (when weight_decay > 0)
//! g' = g + d
//! v  = momentum · v − lr · g'      (when momentum > 0, v starts at 0)
//! w  = w + v                       (nesterov: w + momentum · v − lr · g')
//! w  = w − lr · g'                 (when momentum == 0)
//! ```
//!
//! Per-parameter state lives here, keyed by the parameter's tensor id, and
//! is created the first time a parameter receives a gradient.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, TensorId, Var};
use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};

use alexnet_common::{Error, Result};

/// Hyper-parameters for [`AlexSgd`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamsAlexSgd {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

impl Default for ParamsAlexSgd {
    fn default() -> Self {
        Self {
            lr: 0.02,
            momentum: 0.9,
            weight_decay: 5e-4,
            nesterov: false,
        }
    }
}

impl ParamsAlexSgd {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.momentum) {
            return Err(Error::invalid_config(format!(
                "momentum must be in [0, 1], got {}",
                self.momentum
            )));
        }
        if !(0.0..=1.0).contains(&self.weight_decay) {
            return Err(Error::invalid_config(format!(
                "weight_decay must be in [0, 1], got {}",
                self.weight_decay
            )));
        }
        if !(self.lr >= 0.0 && self.lr.is_finite()) {
            return Err(Error::invalid_config(format!(
                "learning rate must be >= 0, got {}",
                self.lr
            )));
        }
        Ok(())
    }
}

/// Optimizer-owned accumulators for one parameter.
struct ParamState {
    velocity: Option<Var>,
    decay: Option<Var>,
}

pub struct AlexSgd {
    vars: Vec<Var>,
    state: HashMap<TensorId, ParamState>,
    params: ParamsAlexSgd,
}

impl AlexSgd {
    /// Validating constructor returning the typed `InvalidConfiguration`.
    /// The [`Optimizer::new`] impl flattens it into a candle error.
    pub fn try_new(vars: Vec<Var>, params: ParamsAlexSgd) -> Result<Self> {
        params.validate()?;
        let vars = vars
            .into_iter()
            .filter(|v| v.dtype().is_float())
            .collect();
        Ok(Self {
            vars,
            state: HashMap::new(),
            params,
        })
    }

    pub fn params(&self) -> &ParamsAlexSgd {
        &self.params
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    /// Momentum accumulator of `var`, if it has been updated at least once.
    pub fn velocity(&self, var: &Var) -> Option<&Tensor> {
        self.state
            .get(&var.id())
            .and_then(|s| s.velocity.as_ref())
            .map(|v| v.as_tensor())
    }

    /// Last weight-decay term folded into `var`'s gradient.
    pub fn decay_term(&self, var: &Var) -> Option<&Tensor> {
        self.state
            .get(&var.id())
            .and_then(|s| s.decay.as_ref())
            .map(|d| d.as_tensor())
    }

    /// Apply one update to a single parameter.
    pub fn update(&mut self, var: &Var, grad: &Tensor) -> candle_core::Result<()> {
        let ParamsAlexSgd {
            lr,
            momentum,
            weight_decay,
            nesterov,
        } = self.params;

        let state = self.state.entry(var.id()).or_insert(ParamState {
            velocity: None,
            decay: None,
        });

        let grad = if weight_decay > 0.0 {
            let d = var.affine(weight_decay, 0.0)?;
            let acc = match state.decay.take() {
                Some(acc) => {
                    acc.set(&d)?;
                    acc
                }
                None => Var::from_tensor(&d)?,
            };
            state.decay = Some(acc);
            (grad + d)?
        } else {
            grad.clone()
        };

        if momentum > 0.0 {
            let velocity = match state.velocity.take() {
                Some(v) => v,
                None => Var::zeros(var.dims(), var.dtype(), var.device())?,
            };
            let step = grad.affine(lr, 0.0)?;
            let next_v = (velocity.affine(momentum, 0.0)? - &step)?;
            let next_w = if nesterov {
                ((var.as_tensor() + next_v.affine(momentum, 0.0)?)? - &step)?
            } else {
                (var.as_tensor() + &next_v)?
            };
            velocity.set(&next_v)?;
            state.velocity = Some(velocity);
            var.set(&next_w)
        } else {
            var.set(&var.sub(&grad.affine(lr, 0.0)?)?)
        }
    }
}

impl Optimizer for AlexSgd {
    type Config = ParamsAlexSgd;

    fn new(vars: Vec<Var>, params: ParamsAlexSgd) -> candle_core::Result<Self> {
        Self::try_new(vars, params).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        // Cloned handles share storage with the model's vars.
        let vars = self.vars.clone();
        for var in &vars {
            if let Some(grad) = grads.get(var) {
                self.update(var, grad)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar_var(v: f32) -> Var {
        Var::new(&[v], &Device::Cpu).unwrap()
    }

    /// Gradient of `sum(k · w)` is `k` everywhere.
    fn linear_grads(var: &Var, k: f64) -> GradStore {
        var.as_tensor()
            .affine(k, 0.0)
            .unwrap()
            .sum_all()
            .unwrap()
            .backward()
            .unwrap()
    }

    fn value(var: &Var) -> f32 {
        var.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    fn params(lr: f64, momentum: f64, weight_decay: f64) -> ParamsAlexSgd {
        ParamsAlexSgd {
            lr,
            momentum,
            weight_decay,
            nesterov: false,
        }
    }

    #[test]
    fn accepts_unit_interval() {
        for m in [0.0, 0.5, 0.9, 1.0] {
            for wd in [0.0, 5e-4, 1.0] {
                assert!(AlexSgd::try_new(vec![], params(0.1, m, wd)).is_ok());
            }
        }
    }

    #[test]
    fn rejects_out_of_range() {
        for (m, wd) in [(-0.1, 0.0), (1.1, 0.0), (0.9, -1e-4), (0.9, 1.5), (f64::NAN, 0.0)] {
            let err = AlexSgd::try_new(vec![], params(0.1, m, wd)).err().unwrap();
            assert!(matches!(err, Error::InvalidConfiguration(_)), "{m} {wd}");
        }
        assert!(<AlexSgd as Optimizer>::new(vec![], params(0.1, 2.0, 0.0)).is_err());
    }

    #[test]
    fn momentum_worked_example() {
        let w = scalar_var(1.0);
        let mut opt = AlexSgd::try_new(vec![w.clone()], params(0.1, 0.9, 0.0)).unwrap();
        assert!(opt.velocity(&w).is_none());

        opt.step(&linear_grads(&w, 2.0)).unwrap();
        let v = opt.velocity(&w).unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((v + 0.2).abs() < 1e-6, "v = {v}");
        assert!((value(&w) - 0.8).abs() < 1e-6);

        opt.step(&linear_grads(&w, 2.0)).unwrap();
        let v = opt.velocity(&w).unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((v + 0.38).abs() < 1e-6, "v = {v}");
        assert!((1.0 - value(&w) - 0.58).abs() < 1e-6);
    }

    #[test]
    fn plain_descent_has_no_hidden_state() {
        let w = scalar_var(1.0);
        let mut opt = AlexSgd::try_new(vec![w.clone()], params(0.1, 0.0, 0.0)).unwrap();
        for i in 1..=3 {
            let before = value(&w);
            opt.step(&linear_grads(&w, 2.0)).unwrap();
            assert!((before - value(&w) - 0.2).abs() < 1e-6, "step {i}");
        }
        assert!(opt.velocity(&w).is_none());
    }

    #[test]
    fn weight_decay_is_folded_into_gradient() {
        let w = scalar_var(2.0);
        let mut opt = AlexSgd::try_new(vec![w.clone()], params(0.1, 0.0, 0.5)).unwrap();
        opt.step(&linear_grads(&w, 1.0)).unwrap();
        // g' = 1 + 0.5 * 2 = 2 → w = 2 - 0.1 * 2
        assert!((value(&w) - 1.8).abs() < 1e-6);
        let d = opt.decay_term(&w).unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((d - 1.0).abs() < 1e-6);
    }

    #[test]
    fn weight_decay_before_momentum() {
        let w = scalar_var(1.0);
        let mut opt = AlexSgd::try_new(vec![w.clone()], params(0.1, 0.9, 0.5)).unwrap();
        opt.step(&linear_grads(&w, 2.0)).unwrap();
        // g' = 2 + 0.5 = 2.5 → v = -0.25
        let v = opt.velocity(&w).unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((v + 0.25).abs() < 1e-6);
        assert!((value(&w) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn nesterov_variant() {
        let w = scalar_var(1.0);
        let mut opt = AlexSgd::try_new(
            vec![w.clone()],
            ParamsAlexSgd {
                nesterov: true,
                ..params(0.1, 0.9, 0.0)
            },
        )
        .unwrap();
        opt.step(&linear_grads(&w, 2.0)).unwrap();
        // v = -0.2; w = 1 + 0.9 * -0.2 - 0.2
        assert!((value(&w) - 0.62).abs() < 1e-6);
    }

    #[test]
    fn no_params_is_a_noop() {
        let w = scalar_var(1.0);
        let grads = linear_grads(&w, 2.0);
        let mut opt = AlexSgd::try_new(vec![], params(0.1, 0.9, 0.0)).unwrap();
        opt.step(&grads).unwrap();
        assert_eq!(opt.num_vars(), 0);
        assert_eq!(value(&w), 1.0);
    }

    #[test]
    fn params_without_gradient_are_skipped() {
        let w = scalar_var(1.0);
        let frozen = scalar_var(3.0);
        let mut opt =
            AlexSgd::try_new(vec![w.clone(), frozen.clone()], params(0.1, 0.9, 0.5)).unwrap();
        opt.step(&linear_grads(&w, 2.0)).unwrap();
        assert_eq!(value(&frozen), 3.0);
        assert!(opt.velocity(&frozen).is_none());
    }

    #[test]
    fn learning_rate_is_read_every_step() {
        let w = scalar_var(1.0);
        let mut opt = AlexSgd::try_new(vec![w.clone()], params(0.1, 0.0, 0.0)).unwrap();
        opt.set_learning_rate(0.05);
        assert_eq!(opt.learning_rate(), 0.05);
        opt.step(&linear_grads(&w, 2.0)).unwrap();
        assert!((value(&w) - 0.9).abs() < 1e-6);
    }
}
