use serde::{Deserialize, Serialize};

/// Per-epoch exponential decay, `lr(epoch) = base_lr * gamma^(epoch - 1)`.
///
/// Epochs are 1-based. The schedule is stateless so a resumed run lands on
/// the same rate as an uninterrupted one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExponentialLr {
    pub base_lr: f64,
    pub gamma: f64,
}

impl ExponentialLr {
    pub fn new(base_lr: f64, gamma: f64) -> Self {
        Self { base_lr, gamma }
    }

    pub fn lr_for_epoch(&self, epoch: usize) -> f64 {
        let exponent = epoch.saturating_sub(1);
        self.base_lr * self.gamma.powi(exponent.min(i32::MAX as usize) as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_epoch_uses_base_rate() {
        let schedule = ExponentialLr::new(2e-4, 0.999875);
        assert_eq!(schedule.lr_for_epoch(1), 2e-4);
        // epoch 0 is treated like epoch 1
        assert_eq!(schedule.lr_for_epoch(0), 2e-4);
    }

    #[test]
    fn decays_once_per_epoch() {
        let schedule = ExponentialLr::new(1.0, 0.5);
        assert_eq!(schedule.lr_for_epoch(2), 0.5);
        assert_eq!(schedule.lr_for_epoch(4), 0.125);
        assert!(schedule.lr_for_epoch(5) < schedule.lr_for_epoch(4));
    }
}
