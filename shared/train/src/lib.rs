mod bootstrap;
mod cli;
mod evaluation;
mod loader;
pub mod logging;
mod orchestrator;
#[cfg(test)]
mod test_support;

pub use bootstrap::{BootstrapError, ProcessGroupBootstrap, WorkerContext};
pub use cli::{Preflight, TrainArgs};
pub use evaluation::EvaluationHarness;
pub use loader::BatchLoader;
pub use logging::{logging, LogOutput};
pub use orchestrator::{
    step_summary, CorruptCheckpointPolicy, Leader, Orchestrator, ResumePoint, RunOptions,
    Trainer, TrainingContext,
};

/// Builds the runtime `vits-train` runs on. The collective library's environment
/// is set first, while the process still has a single thread.
pub fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    vits_modeling::set_suggested_env_vars();
    tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
}
