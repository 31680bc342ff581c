mod audio;
mod batch;
mod checkpoint;
mod device_utils;
pub mod losses;
pub mod metrics;
mod models;
mod optimizer;
mod parallelism;
mod scaler;
#[cfg(test)]
mod test_support;
mod trainer;

pub use audio::{
    fit_length, mel_filterbank, rand_slice_ids, sequence_mask, slice_segments, SpectralTransform,
};
pub use batch::TrainingBatch;
pub use checkpoint::{CheckpointError, CheckpointMeta, CheckpointStore, Role};
pub use device_utils::{get_optimal_devices, Devices, DevicesParseError};
pub use models::*;
pub use optimizer::{AdamW, AdamWConfig, OptimizerStateError};
pub use parallelism::{
    CollectiveBackend, CollectiveError, Communicator, Endpoint, HostPlatform, HostStagedGroup,
    ReduceType, Rendezvous, DEFAULT_RENDEZVOUS,
};
pub use scaler::{ScaleController, ScaleState, Unscaled};
pub use trainer::{
    DiscriminatorReport, GeneratorReport, PairedForward, StepOutput, StepVisuals, TrainingStep,
};

/// Seeds torch's global generator. Every rank passes the same `train.seed`.
pub fn set_torch_rng_seed(seed: u64) {
    tch::manual_seed(seed as i64);
}

pub fn set_suggested_env_vars() {
    std::env::set_var("NCCL_P2P_DIRECT_DISABLE", "1");
    std::env::set_var("NCCL_LAUNCH_MODE", "GROUP");
}
