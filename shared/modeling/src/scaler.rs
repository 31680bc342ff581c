//! Dynamic loss scaling for mixed-precision training.
//!
//! Per batch the caller runs, for each optimizer in turn,
//! [`ScaleController::scale`] → backward → [`ScaleController::unscale`] →
//! [`ScaleController::step`], then [`ScaleController::update`] once. A step
//! whose gradients contain inf or NaN is skipped and the scale backs off at the
//! next update; after `growth_interval` clean batches it grows.

use tch::{Kind, Tensor};
use tracing::debug;
use vits_core::TrainConfig;

use crate::AdamW;

const GROWTH_FACTOR: f64 = 2.0;
const BACKOFF_FACTOR: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleState {
    pub scale: f64,
    /// Consecutive batches without an overflow.
    pub growth_tracker: u32,
    pub growth_interval: u32,
}

/// Proof that an optimizer's gradients were unscaled, carrying whether any of
/// them overflowed. Consumed by [`ScaleController::step`].
#[must_use]
#[derive(Debug)]
pub struct Unscaled {
    found_inf: bool,
}

impl Unscaled {
    pub fn found_inf(&self) -> bool {
        self.found_inf
    }
}

#[derive(Debug)]
pub struct ScaleController {
    enabled: bool,
    state: ScaleState,
    found_inf_this_batch: bool,
}

impl ScaleController {
    pub fn new(enabled: bool, init_scale: f64, growth_interval: u32) -> Self {
        Self {
            enabled,
            state: ScaleState {
                scale: init_scale,
                growth_tracker: 0,
                growth_interval,
            },
            found_inf_this_batch: false,
        }
    }

    pub fn from_config(train: &TrainConfig) -> Self {
        Self::new(train.fp16_run, train.init_scale, train.growth_interval)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> ScaleState {
        self.state
    }

    /// The factor losses are multiplied by; 1 when scaling is off.
    pub fn scale_factor(&self) -> f64 {
        if self.enabled {
            self.state.scale
        } else {
            1.0
        }
    }

    pub fn scale(&self, loss: &Tensor) -> Tensor {
        if self.enabled {
            loss * self.state.scale
        } else {
            loss.shallow_clone()
        }
    }

    /// Divides the optimizer's gradients by the current scale and checks them
    /// for non-finite values.
    pub fn unscale(&self, optimizer: &AdamW) -> Unscaled {
        if !self.enabled {
            return Unscaled { found_inf: false };
        }
        let _guard = tch::no_grad_guard();
        let inv_scale = 1.0 / self.state.scale;
        let mut non_finite: Option<Tensor> = None;
        for mut grad in optimizer.gradients() {
            let _ = grad.g_mul_scalar_(inv_scale);
            let bad = grad.isfinite().logical_not().sum(Kind::Float);
            non_finite = Some(match non_finite {
                Some(acc) => {
                    let device = acc.device();
                    acc + bad.to_device(device)
                }
                None => bad,
            });
        }
        let found_inf = non_finite.is_some_and(|n| n.double_value(&[]) > 0.0);
        Unscaled { found_inf }
    }

    /// Applies the optimizer update unless the unscaled gradients overflowed.
    /// Returns whether the update was applied.
    pub fn step(&mut self, optimizer: &mut AdamW, unscaled: Unscaled) -> bool {
        if unscaled.found_inf {
            self.found_inf_this_batch = true;
            debug!(scale = self.state.scale, "skipping optimizer step on non-finite gradients");
            false
        } else {
            optimizer.step();
            true
        }
    }

    pub fn update(&mut self) {
        if !self.enabled {
            return;
        }
        if std::mem::take(&mut self.found_inf_this_batch) {
            self.state.scale *= BACKOFF_FACTOR;
            self.state.growth_tracker = 0;
        } else {
            self.state.growth_tracker += 1;
            if self.state.growth_tracker >= self.state.growth_interval {
                self.state.scale *= GROWTH_FACTOR;
                self.state.growth_tracker = 0;
            }
        }
    }
}
