//! Decoupled-weight-decay Adam over a `VarStore`.
//!
//! ```text
//! m_t = β1 * m_{t-1} + (1 - β1) * g_t
//! v_t = β2 * v_{t-1} + (1 - β2) * g_t^2
//! θ_t = θ_{t-1} * (1 - lr * wd) - lr * m̂_t / (sqrt(v̂_t) + eps)
//! ```
//!
//! Moments are kept in fp32 and keyed by the variable's path in the store, so
//! they can be written next to the parameters in a checkpoint.

use std::collections::{BTreeMap, HashMap};

use tch::{nn::VarStore, Kind, Tensor};
use thiserror::Error;
use vits_core::TrainConfig;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdamWConfig {
    pub lr: f64,
    pub betas: [f64; 2],
    pub eps: f64,
    pub weight_decay: f64,
}

impl AdamWConfig {
    pub fn from_train(train: &TrainConfig) -> Self {
        Self {
            lr: train.learning_rate,
            betas: train.betas,
            eps: train.eps,
            weight_decay: train.weight_decay,
        }
    }
}

#[derive(Debug, Error)]
pub enum OptimizerStateError {
    #[error("optimizer state has no entry for {0}")]
    Missing(String),

    #[error("optimizer state for {name} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },
}

struct ParamState {
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

pub struct AdamW {
    config: AdamWConfig,
    lr: f64,
    /// Shallow handles to the store's variables, ordered by name so every
    /// rank walks them in the same order.
    parameters: Vec<(String, Tensor)>,
    states: HashMap<String, ParamState>,
    step: u64,
}

impl AdamW {
    pub fn new(vs: &VarStore, config: AdamWConfig) -> Self {
        let parameters: Vec<(String, Tensor)> = vs
            .variables()
            .into_iter()
            .collect::<BTreeMap<_, _>>()
            .into_iter()
            .filter(|(_, tensor)| tensor.requires_grad())
            .collect();
        let states = parameters
            .iter()
            .map(|(name, tensor)| {
                let options = (Kind::Float, tensor.device());
                (
                    name.clone(),
                    ParamState {
                        exp_avg: Tensor::zeros(tensor.size(), options),
                        exp_avg_sq: Tensor::zeros(tensor.size(), options),
                    },
                )
            })
            .collect();
        Self {
            lr: config.lr,
            config,
            parameters,
            states,
            step: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.parameters.iter().map(|(name, t)| (name.as_str(), t))
    }

    /// Gradients of every parameter that took part in the last backward pass,
    /// in parameter order.
    pub fn gradients(&self) -> Vec<Tensor> {
        self.parameters
            .iter()
            .map(|(_, t)| t.grad())
            .filter(|g| g.defined())
            .collect()
    }

    pub fn zero_grad(&self) {
        for (_, tensor) in &self.parameters {
            let mut grad = tensor.grad();
            if grad.defined() {
                let _ = grad.zero_();
            }
        }
    }

    /// Clamps each gradient element to `[-clip, clip]` when `clip` is given
    /// and returns the global L2 norm measured before clamping.
    pub fn clip_grad_value(&self, clip: Option<f64>) -> f64 {
        let _guard = tch::no_grad_guard();
        let mut total = 0f64;
        for mut grad in self.gradients() {
            let norm = grad.to_kind(Kind::Float).norm().double_value(&[]);
            total += norm * norm;
            if let Some(clip) = clip {
                let _ = grad.clamp_(-clip, clip);
            }
        }
        total.sqrt()
    }

    pub fn step(&mut self) {
        self.step += 1;
        let step = self.step as i32;
        let [beta1, beta2] = self.config.betas;
        let lr = self.lr;
        let bias_correction1 = 1.0 - beta1.powi(step);
        let bias_correction2 = 1.0 - beta2.powi(step);

        let _guard = tch::no_grad_guard();
        for (name, tensor) in &self.parameters {
            let grad = tensor.grad();
            if !grad.defined() {
                continue;
            }
            let Some(state) = self.states.get_mut(name) else {
                continue;
            };
            let grad = grad.to_kind(Kind::Float);

            let _ = state.exp_avg.g_mul_scalar_(beta1);
            let _ = state.exp_avg.g_add_(&(&grad * (1.0 - beta1)));
            let _ = state.exp_avg_sq.g_mul_scalar_(beta2);
            let _ = state.exp_avg_sq.g_add_(&(grad.square() * (1.0 - beta2)));

            let denom = (&state.exp_avg_sq / bias_correction2).sqrt() + self.config.eps;
            let update = (&state.exp_avg / bias_correction1) / denom;

            let mut tensor = tensor.shallow_clone();
            if self.config.weight_decay > 0.0 {
                let _ = tensor.g_mul_scalar_(1.0 - lr * self.config.weight_decay);
            }
            let _ = tensor.g_add_(&(update.to_kind(tensor.kind()) * -lr));
        }
    }

    /// Moment buffers named `exp_avg.<param>` and `exp_avg_sq.<param>`.
    pub fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let mut out = Vec::with_capacity(self.parameters.len() * 2);
        for (name, _) in &self.parameters {
            if let Some(state) = self.states.get(name) {
                out.push((format!("exp_avg.{name}"), state.exp_avg.shallow_clone()));
                out.push((format!("exp_avg_sq.{name}"), state.exp_avg_sq.shallow_clone()));
            }
        }
        out
    }

    /// Loads moment buffers produced by [`AdamW::state_tensors`] and the step
    /// counter they were saved with.
    pub fn restore_state(
        &mut self,
        tensors: &HashMap<String, Tensor>,
        step: u64,
    ) -> Result<(), OptimizerStateError> {
        for (name, state) in &self.states {
            for (prefix, target) in [
                ("exp_avg", &state.exp_avg),
                ("exp_avg_sq", &state.exp_avg_sq),
            ] {
                let key = format!("{prefix}.{name}");
                let source = tensors
                    .get(&key)
                    .ok_or_else(|| OptimizerStateError::Missing(key.clone()))?;
                if source.size() != target.size() {
                    return Err(OptimizerStateError::ShapeMismatch {
                        name: key,
                        expected: target.size(),
                        found: source.size(),
                    });
                }
            }
        }

        let _guard = tch::no_grad_guard();
        for (name, state) in self.states.iter_mut() {
            let source = &tensors[&format!("exp_avg.{name}")];
            state.exp_avg.copy_(&source.to_device(state.exp_avg.device()).to_kind(Kind::Float));
            let source = &tensors[&format!("exp_avg_sq.{name}")];
            state
                .exp_avg_sq
                .copy_(&source.to_device(state.exp_avg_sq.device()).to_kind(Kind::Float));
        }
        self.step = step;
        Ok(())
    }
}

impl std::fmt::Debug for AdamW {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdamW")
            .field("config", &self.config)
            .field("lr", &self.lr)
            .field("step", &self.step)
            .field("num_params", &self.parameters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Device};

    fn config() -> AdamWConfig {
        AdamWConfig {
            lr: 0.1,
            betas: [0.8, 0.99],
            eps: 1e-9,
            weight_decay: 0.0,
        }
    }

    fn quadratic(vs: &VarStore) -> Tensor {
        let w = vs.root().var("w", &[3], nn::Init::Const(1.0));
        w.square().sum(Kind::Float)
    }

    #[test]
    fn first_step_moves_by_lr_against_gradient_sign() {
        let vs = VarStore::new(Device::Cpu);
        let loss = quadratic(&vs);
        let mut opt = AdamW::new(&vs, config());
        opt.zero_grad();
        loss.backward();
        opt.step();
        let w = vs.variables()["w"].shallow_clone();
        // bias-corrected first step is lr * sign(g)
        assert!((w.double_value(&[0]) - 0.9).abs() < 1e-5);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn weight_decay_is_decoupled() {
        let vs = VarStore::new(Device::Cpu);
        let _ = vs.root().var("w", &[2], nn::Init::Const(2.0));
        let mut opt = AdamW::new(
            &vs,
            AdamWConfig {
                weight_decay: 0.5,
                ..config()
            },
        );
        let w = vs.variables()["w"].shallow_clone();
        (&w * 0.0).sum(Kind::Float).backward();
        opt.step();
        // zero gradient leaves only the decay term
        assert!((w.double_value(&[0]) - 2.0 * (1.0 - 0.1 * 0.5)).abs() < 1e-6);
    }

    #[test]
    fn clip_reports_norm_before_clamping() {
        let vs = VarStore::new(Device::Cpu);
        let w = vs.root().var("w", &[2], nn::Init::Const(0.0));
        let opt = AdamW::new(&vs, config());
        (&w * Tensor::from_slice(&[3.0f32, 4.0])).sum(Kind::Float).backward();
        let norm = opt.clip_grad_value(Some(1.0));
        assert!((norm - 5.0).abs() < 1e-6);
        assert_eq!(Vec::<f32>::try_from(&w.grad()).unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn state_round_trips() {
        let vs = VarStore::new(Device::Cpu);
        let loss = quadratic(&vs);
        let mut opt = AdamW::new(&vs, config());
        loss.backward();
        opt.step();

        let saved: HashMap<String, Tensor> = opt
            .state_tensors()
            .into_iter()
            .map(|(k, v)| (k, v.copy()))
            .collect();
        assert!(saved.contains_key("exp_avg.w"));

        let mut fresh = AdamW::new(&vs, config());
        fresh.restore_state(&saved, opt.step_count()).unwrap();
        assert_eq!(fresh.step_count(), 1);
        let restored: HashMap<_, _> = fresh.state_tensors().into_iter().collect();
        assert!(restored["exp_avg_sq.w"].equal(&saved["exp_avg_sq.w"]));

        let mut missing = saved;
        missing.remove("exp_avg.w");
        assert!(matches!(
            fresh.restore_state(&missing, 1),
            Err(OptimizerStateError::Missing(_))
        ));
    }
}
