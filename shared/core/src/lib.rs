mod hparams;
mod lr_schedule;
mod shuffle;

pub use hparams::{DataConfig, HParams, HParamsError, ModelConfig, TrainConfig};
pub use lr_schedule::ExponentialLr;
pub use shuffle::Shuffle;
