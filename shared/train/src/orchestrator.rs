//! The per-rank epoch loop: resume, train, log, evaluate, save.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::ValueEnum;
use tch::Device;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};
use vits_core::{ExponentialLr, HParams};
use vits_data_provider::{BucketedShardSampler, TextAudioSpeakerDataset};
use vits_modeling::{
    metrics::{FileSink, Image, MetricsError, MetricsSink, Summary},
    CheckpointError, CheckpointStore, Communicator, MultiPeriodDiscriminator, ReduceType, Role,
    ScaleController, StepOutput, SynthesizerTrn, TrainingBatch, TrainingStep,
};

use crate::{bootstrap::WorkerContext, evaluation::EvaluationHarness, loader::BatchLoader};

pub type Trainer = TrainingStep<SynthesizerTrn, MultiPeriodDiscriminator>;

/// What to do when a checkpoint exists but can't be read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum CorruptCheckpointPolicy {
    #[default]
    Fail,
    ColdStart,
}

/// Where a run starts, decided from the files in the model directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumePoint {
    Cold,
    /// Both roles have a checkpoint at `step`.
    Restore { step: u64 },
}

impl ResumePoint {
    /// The latest step saved for both roles. A step only one role has is
    /// never used, so the two models always come from the same step.
    pub fn resolve(store: &CheckpointStore) -> Result<Self, CheckpointError> {
        let generator = store.steps(Role::Generator)?;
        let discriminator = store.steps(Role::Discriminator)?;
        Ok(generator
            .iter()
            .rev()
            .find(|&&step| discriminator.binary_search(&step).is_ok())
            .map_or(ResumePoint::Cold, |&step| ResumePoint::Restore { step }))
    }
}

/// Position in the run. Owned by the orchestrator, advanced once per batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrainingContext {
    /// 1-based.
    pub epoch: usize,
    pub global_step: u64,
}

impl TrainingContext {
    pub fn cold() -> Self {
        Self {
            epoch: 1,
            global_step: 0,
        }
    }

    /// Restarts at the beginning of the saved epoch.
    pub fn resumed(epoch: usize, batches_per_epoch: usize) -> Self {
        Self {
            epoch: epoch.max(1),
            global_step: (epoch.saturating_sub(1) * batches_per_epoch) as u64,
        }
    }
}

/// Scalars and slice images for one training step.
pub fn step_summary(step: u64, out: &StepOutput, lr: f64) -> Result<Summary, MetricsError> {
    let d = &out.discriminator;
    let g = &out.generator;
    let mut summary = Summary::new(step)
        .scalar("loss/g/total", g.loss)
        .scalar("loss/d/total", d.loss)
        .scalar("learning_rate", lr)
        .scalar("grad_norm_d", d.grad_norm)
        .scalar("grad_norm_g", g.grad_norm)
        .scalar("loss/g/fm", g.feature_matching)
        .scalar("loss/g/mel", g.mel)
        .scalar("loss/g/dur", g.duration)
        .scalar("loss/g/kl", g.kl);
    for (i, loss) in g.per_discriminator.iter().enumerate() {
        summary = summary.scalar(format!("loss/g/{i}"), *loss);
    }
    for (i, loss) in d.real_losses.iter().enumerate() {
        summary = summary.scalar(format!("loss/d_r/{i}"), *loss);
    }
    for (i, loss) in d.fake_losses.iter().enumerate() {
        summary = summary.scalar(format!("loss/d_g/{i}"), *loss);
    }
    let v = &out.visuals;
    Ok(summary
        .image("slice/mel_org", Image::from_tensor(&v.y_mel)?)
        .image("slice/mel_gen", Image::from_tensor(&v.y_hat_mel)?)
        .image("all/mel", Image::from_tensor(&v.mel)?)
        .image("all/attn", Image::from_tensor(&v.attn)?))
}

/// Rank 0's resources. Other ranks have none, so leader-only work is an
/// `if let Some(leader)`.
pub struct Leader {
    train_sink: Box<dyn MetricsSink>,
    eval_sink: Box<dyn MetricsSink>,
    harness: EvaluationHarness,
}

impl Leader {
    pub fn new(
        train_sink: Box<dyn MetricsSink>,
        eval_sink: Box<dyn MetricsSink>,
        harness: EvaluationHarness,
    ) -> Self {
        Self {
            train_sink,
            eval_sink,
            harness,
        }
    }

    fn log_step(
        &mut self,
        ctx: &TrainingContext,
        batch_idx: usize,
        batches: usize,
        out: &StepOutput,
        lr: f64,
    ) -> Result<()> {
        let progress = 100.0 * batch_idx as f64 / batches.max(1) as f64;
        info!("Train Epoch: {} [{progress:.0}%]", ctx.epoch);
        info!(
            "{:?} {:?}",
            out.loss_vector(),
            [ctx.global_step as f64, lr]
        );
        if !out.discriminator.applied || !out.generator.applied {
            info!(
                discriminator = out.discriminator.applied,
                generator = out.generator.applied,
                "Optimizer step skipped on overflow"
            );
        }
        self.train_sink
            .summarize(&step_summary(ctx.global_step, out, lr)?)?;
        Ok(())
    }

    fn evaluate(&mut self, generator: &mut SynthesizerTrn, global_step: u64) -> Result<()> {
        let summary = self.harness.evaluate(generator, global_step)?;
        self.eval_sink.summarize(&summary)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub model_dir: PathBuf,
    pub on_corrupt_checkpoint: CorruptCheckpointPolicy,
    /// Batches read ahead of the training step.
    pub prefetch: usize,
}

impl RunOptions {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            on_corrupt_checkpoint: CorruptCheckpointPolicy::default(),
            prefetch: 2,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    hparams: Arc<HParams>,
    options: Arc<RunOptions>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(hparams: HParams, options: RunOptions, cancel: CancellationToken) -> Self {
        Self {
            hparams: Arc::new(hparams),
            options: Arc::new(options),
            cancel,
        }
    }

    fn build_trainer(&self, device: Device, comm: Communicator) -> Trainer {
        let hparams = &self.hparams;
        TrainingStep::new(
            SynthesizerTrn::new(hparams, device),
            MultiPeriodDiscriminator::new(hparams, device),
            ScaleController::from_config(&hparams.train),
            comm,
            hparams,
        )
    }

    /// Loads both roles at `point`. Returns the epoch they were saved in.
    fn restore(
        store: &CheckpointStore,
        trainer: &mut Trainer,
        point: ResumePoint,
    ) -> Result<Option<usize>, CheckpointError> {
        let ResumePoint::Restore { step } = point else {
            return Ok(None);
        };
        let (vs, optimizer) = trainer.restore_target(Role::Generator);
        let meta = store.load(Role::Generator, step, vs, optimizer)?;
        let (vs, optimizer) = trainer.restore_target(Role::Discriminator);
        store.load(Role::Discriminator, step, vs, optimizer)?;
        Ok(Some(meta.epoch))
    }

    /// Builds the trainer and puts it where the model directory says the run
    /// left off.
    fn resume(
        &self,
        store: &CheckpointStore,
        device: Device,
        comm: Communicator,
        batches_per_epoch: usize,
    ) -> Result<(Trainer, TrainingContext)> {
        let is_leader = comm.is_leader();
        let mut trainer = self.build_trainer(device, comm);
        let point = ResumePoint::resolve(store)?;
        match Self::restore(store, &mut trainer, point) {
            Ok(Some(epoch)) => Ok((trainer, TrainingContext::resumed(epoch, batches_per_epoch))),
            Ok(None) => Ok((trainer, TrainingContext::cold())),
            Err(err @ CheckpointError::Corrupt { .. })
                if self.options.on_corrupt_checkpoint == CorruptCheckpointPolicy::ColdStart =>
            {
                if is_leader {
                    warn!(error = %err, "Unreadable checkpoint, starting from scratch");
                }
                // one role may already be restored, so start over with both
                let trainer = self.build_trainer(device, trainer.into_communicator());
                Ok((trainer, TrainingContext::cold()))
            }
            Err(CheckpointError::NotFound { role, .. }) => {
                if is_leader {
                    warn!(%role, "Checkpoint disappeared while resuming, starting from scratch");
                }
                let trainer = self.build_trainer(device, trainer.into_communicator());
                Ok((trainer, TrainingContext::cold()))
            }
            Err(err) => Err(err).context("restoring checkpoints"),
        }
    }

    fn leader(&self, device: Device) -> Result<Leader> {
        let hparams = &self.hparams;
        let eval_set =
            TextAudioSpeakerDataset::from_filelist(&hparams.data.validation_files, &hparams.data)
                .context("loading validation filelist")?;
        let harness = EvaluationHarness::from_dataset(&eval_set, hparams, device)
            .context("loading the evaluation example")?;
        let model_dir = &self.options.model_dir;
        Ok(Leader::new(
            Box::new(FileSink::new(model_dir)?),
            Box::new(FileSink::new(model_dir.join("eval"))?),
            harness,
        ))
    }

    /// Trains this rank until the configured epochs are done or every rank
    /// agreed to stop. Returns where training ended.
    pub fn run(&self, worker: WorkerContext) -> Result<TrainingContext> {
        let leader = if worker.is_leader() {
            Some(self.leader(worker.device)?)
        } else {
            None
        };
        self.run_with_leader(worker, leader)
    }

    pub fn run_with_leader(
        &self,
        worker: WorkerContext,
        mut leader: Option<Leader>,
    ) -> Result<TrainingContext> {
        let WorkerContext {
            rank,
            world_size,
            device,
            comm,
            seed,
            ..
        } = worker;
        let span = info_span!("worker", rank);
        let _enter = span.enter();
        let hparams = &self.hparams;
        let train = &hparams.train;

        let dataset = Arc::new(
            TextAudioSpeakerDataset::from_filelist(&hparams.data.training_files, &hparams.data)
                .context("loading training filelist")?,
        );
        let mut sampler = BucketedShardSampler::new(
            dataset.lengths(),
            train.batch_size,
            &train.bucket_boundaries,
            world_size,
            rank,
            true,
            seed,
        )?;
        let batches_per_epoch = sampler.len();

        let store = CheckpointStore::new(&self.options.model_dir);
        let (mut trainer, mut ctx) = self.resume(&store, device, comm, batches_per_epoch)?;
        trainer.broadcast_parameters(0)?;

        if leader.is_some() {
            info!(
                examples = dataset.len(),
                batches_per_epoch,
                world_size,
                epoch = ctx.epoch,
                global_step = ctx.global_step,
                "Starting training"
            );
        }

        let schedule = ExponentialLr::new(train.learning_rate, train.lr_decay);
        let first_epoch = ctx.epoch;
        for epoch in first_epoch..=train.epochs {
            ctx.epoch = epoch;
            trainer.set_lr(schedule.lr_for_epoch(epoch));
            sampler.set_epoch(epoch as u64);
            let batches = sampler.batches();
            let total = batches.len();

            let loader = BatchLoader::spawn(dataset.clone(), batches, self.options.prefetch);
            for (batch_idx, batch) in loader.enumerate() {
                let batch = TrainingBatch::from_cpu(&batch?, device, trainer.transform());
                let out = trainer.step(&batch)?;

                if let Some(leader) = leader.as_mut() {
                    if ctx.global_step % train.log_interval == 0 {
                        leader.log_step(&ctx, batch_idx, total, &out, trainer.lr())?;
                    }
                    if ctx.global_step % train.eval_interval == 0 {
                        leader.evaluate(trainer.generator_mut(), ctx.global_step)?;
                        for role in [Role::Generator, Role::Discriminator] {
                            store.save(
                                role,
                                trainer.var_store(role),
                                trainer.optimizer(role),
                                trainer.lr(),
                                epoch,
                                ctx.global_step,
                            )?;
                        }
                    }
                }
                ctx.global_step += 1;
            }

            if leader.is_some() {
                info!("====> Epoch: {epoch}");
            }

            // every rank leaves after the same epoch
            let cancelled = if self.cancel.is_cancelled() { 1.0 } else { 0.0 };
            let stop = trainer
                .communicator()
                .all_reduce_scalar(cancelled, ReduceType::Max)?;
            if stop > 0.0 {
                if leader.is_some() {
                    info!(epoch, global_step = ctx.global_step, "Stopping on request");
                }
                break;
            }
        }
        Ok(ctx)
    }
}
