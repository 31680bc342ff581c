use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::Level;
use vits_core::HParams;
use vits_modeling::{Devices, HostPlatform, DEFAULT_RENDEZVOUS};

use crate::{logging::LogOutput, orchestrator::CorruptCheckpointPolicy};

#[derive(Parser, Debug)]
#[command(about = "Multi-device GAN training for a text-to-speech synthesizer")]
pub struct TrainArgs {
    /// Hyperparameter JSON with `train`, `data` and `model` sections.
    #[clap(short, long, env)]
    pub config: PathBuf,

    /// Where checkpoints, metrics and the run's config copy are written. Existing
    /// checkpoints here are resumed from.
    #[clap(short, long, env)]
    pub model_dir: PathBuf,

    /// Devices to train on, one rank per device: auto, cpu, cuda or cuda:0,1,...
    #[clap(long, env, default_value = "auto")]
    pub device: Devices,

    /// console: standard logs
    /// json: standard logs with json format
    /// none: no logs
    #[clap(long, env, default_value = "console")]
    pub log_output: LogOutput,

    #[clap(long, env, default_value_t = Level::INFO)]
    pub log_level: Level,

    /// Also write logs to this file. Defaults to `train.log` in the model directory.
    #[clap(long, env)]
    pub write_log: Option<PathBuf>,

    /// What to do if the newest checkpoint can't be read.
    #[clap(long, env, value_enum, default_value_t = CorruptCheckpointPolicy::Fail)]
    pub on_corrupt_checkpoint: CorruptCheckpointPolicy,

    /// Address the ranks meet at to form the process group.
    #[clap(long, env, default_value = DEFAULT_RENDEZVOUS)]
    pub rendezvous: String,

    /// Batches each rank reads ahead of training.
    #[clap(long, env, default_value_t = 2)]
    pub prefetch: usize,
}

/// Outcome of the checks run before anything is written.
#[derive(Debug)]
pub enum Preflight {
    /// Nothing was touched; the run should stop.
    Unsupported(HostPlatform),
    Ready(HParams),
}

impl TrainArgs {
    pub fn log_file(&self) -> PathBuf {
        self.write_log
            .clone()
            .unwrap_or_else(|| self.model_dir.join("train.log"))
    }

    /// Checks the host, then reads the config and prepares the model directory.
    /// The model directory is left alone on a host that can't train.
    pub fn preflight(&self, platform: HostPlatform) -> anyhow::Result<Preflight> {
        if platform.preferred_backend().is_none() {
            return Ok(Preflight::Unsupported(platform));
        }
        let hparams = HParams::from_file(&self.config)
            .with_context(|| format!("reading {}", self.config.display()))?;
        std::fs::create_dir_all(&self.model_dir)
            .with_context(|| format!("creating {}", self.model_dir.display()))?;
        // a copy of the config travels with the checkpoints
        std::fs::write(self.model_dir.join("config.json"), hparams.to_json_pretty()?)?;
        Ok(Preflight::Ready(hparams))
    }
}
