//! One adversarial update per batch.
//!
//! [`TrainingStep::forward`] runs the generator once; the resulting
//! [`PairedForward`] feeds [`TrainingStep::discriminator_step`], whose
//! [`DiscriminatorReport`] is required by [`TrainingStep::generator_step`].
//! The discriminator is therefore always stepped (or skipped) before the
//! generator, against the same generator output.

use tch::{nn::VarStore, Kind, Tensor};
use tracing::trace;
use vits_core::HParams;

use crate::{
    audio::{fit_length, slice_segments},
    losses::{discriminator_loss, feature_loss, generator_loss, kl_loss, mel_loss},
    AdamW, AdamWConfig, CollectiveError, Communicator, Discriminator, GeneratorOutput, ReduceType,
    Role, ScaleController, SpectralTransform, SynthesisGenerator, TrainingBatch,
};

/// Generator output plus the real-side tensors it is compared against.
#[derive(Debug)]
pub struct PairedForward {
    pub output: GeneratorOutput,
    /// Ground-truth waveform cut to the generated window, `[B, 1, segment_size]`.
    pub y: Tensor,
    /// Ground-truth mel over the same window, `[B, n_mels, segment_frames]`.
    pub y_mel: Tensor,
    pub y_hat_mel: Tensor,
    /// Ground-truth mel of the whole batch.
    pub mel: Tensor,
}

#[must_use]
#[derive(Debug, Clone, PartialEq)]
pub struct DiscriminatorReport {
    pub loss: f64,
    pub real_losses: Vec<f64>,
    pub fake_losses: Vec<f64>,
    pub grad_norm: f64,
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorReport {
    /// Sum of every term below.
    pub loss: f64,
    pub adversarial: f64,
    pub per_discriminator: Vec<f64>,
    pub feature_matching: f64,
    /// Weighted by `c_mel`.
    pub mel: f64,
    pub duration: f64,
    /// Weighted by `c_kl`.
    pub kl: f64,
    pub grad_norm: f64,
    pub applied: bool,
}

/// First-row tensors the leader turns into images.
#[derive(Debug)]
pub struct StepVisuals {
    pub y_mel: Tensor,
    pub y_hat_mel: Tensor,
    pub mel: Tensor,
    pub attn: Tensor,
}

#[derive(Debug)]
pub struct StepOutput {
    pub discriminator: DiscriminatorReport,
    pub generator: GeneratorReport,
    pub visuals: StepVisuals,
}

impl StepOutput {
    /// `[disc, gen, fm, mel, dur, kl]`, the order progress lines print them in.
    pub fn loss_vector(&self) -> [f64; 6] {
        let g = &self.generator;
        [
            self.discriminator.loss,
            g.adversarial,
            g.feature_matching,
            g.mel,
            g.duration,
            g.kl,
        ]
    }
}

pub struct TrainingStep<G, D> {
    generator: G,
    discriminator: D,
    optim_g: AdamW,
    optim_d: AdamW,
    scaler: ScaleController,
    comm: Communicator,
    transform: SpectralTransform,
    segment_size: i64,
    segment_frames: i64,
    c_mel: f64,
    c_kl: f64,
    grad_clip: Option<f64>,
    autocast: bool,
}

impl<G: SynthesisGenerator, D: Discriminator> TrainingStep<G, D> {
    pub fn new(
        generator: G,
        discriminator: D,
        scaler: ScaleController,
        comm: Communicator,
        hparams: &HParams,
    ) -> Self {
        let device = generator.var_store().device();
        let config = AdamWConfig::from_train(&hparams.train);
        let optim_g = AdamW::new(generator.var_store(), config);
        let optim_d = AdamW::new(discriminator.var_store(), config);
        Self {
            generator,
            discriminator,
            optim_g,
            optim_d,
            scaler,
            comm,
            transform: SpectralTransform::new(&hparams.data, device),
            segment_size: hparams.train.segment_size,
            segment_frames: hparams.segment_frames(),
            c_mel: hparams.train.c_mel,
            c_kl: hparams.train.c_kl,
            grad_clip: hparams.train.grad_clip_value,
            autocast: hparams.train.fp16_run && device.is_cuda(),
        }
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn generator_mut(&mut self) -> &mut G {
        &mut self.generator
    }

    pub fn discriminator(&self) -> &D {
        &self.discriminator
    }

    pub fn optimizer(&self, role: Role) -> &AdamW {
        match role {
            Role::Generator => &self.optim_g,
            Role::Discriminator => &self.optim_d,
        }
    }

    pub fn optimizer_mut(&mut self, role: Role) -> &mut AdamW {
        match role {
            Role::Generator => &mut self.optim_g,
            Role::Discriminator => &mut self.optim_d,
        }
    }

    pub fn var_store(&self, role: Role) -> &VarStore {
        match role {
            Role::Generator => self.generator.var_store(),
            Role::Discriminator => self.discriminator.var_store(),
        }
    }

    /// The model and optimizer of `role`, borrowed together for restoring.
    pub fn restore_target(&mut self, role: Role) -> (&VarStore, &mut AdamW) {
        match role {
            Role::Generator => (self.generator.var_store(), &mut self.optim_g),
            Role::Discriminator => (self.discriminator.var_store(), &mut self.optim_d),
        }
    }

    /// Gives the group handle back so a fresh step can be built on it.
    pub fn into_communicator(self) -> Communicator {
        self.comm
    }

    pub fn scaler(&self) -> &ScaleController {
        &self.scaler
    }

    pub fn communicator(&self) -> &Communicator {
        &self.comm
    }

    pub fn transform(&self) -> &SpectralTransform {
        &self.transform
    }

    pub fn lr(&self) -> f64 {
        self.optim_g.lr()
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.optim_g.set_lr(lr);
        self.optim_d.set_lr(lr);
    }

    /// Overwrites both models' parameters on every rank with `root`'s.
    pub fn broadcast_parameters(&self, root: usize) -> Result<(), CollectiveError> {
        for optimizer in [&self.optim_g, &self.optim_d] {
            let params: Vec<Tensor> = optimizer.parameters().map(|(_, t)| t.shallow_clone()).collect();
            self.comm.broadcast(&params, root)?;
        }
        Ok(())
    }

    /// Averages `role`'s gradients across ranks. Every rank has to call this
    /// the same number of times in the same order.
    pub fn synchronize_gradients(&self, role: Role) -> Result<(), CollectiveError> {
        let grads = self.optimizer(role).gradients();
        trace!(%role, tensors = grads.len(), "all-reduce gradients");
        self.comm.all_reduce(&grads, ReduceType::Mean)
    }

    /// Generator training forward plus the matching real-side slices and mels.
    pub fn forward(&self, batch: &TrainingBatch) -> PairedForward {
        let output = tch::autocast(self.autocast, || self.generator.forward_train(batch));

        let (y, y_mel, mel) = tch::no_grad(|| {
            let mel = self.transform.spec_to_mel(&batch.spec);
            let frames = mel.size()[2].max(self.segment_frames);
            let y_mel = slice_segments(
                &fit_length(&mel, frames),
                &output.ids_slice,
                self.segment_frames,
            );
            let hop = self.transform.hop_length();
            let samples = batch.wav.size()[2].max(frames * hop);
            let y = slice_segments(
                &fit_length(&batch.wav, samples),
                &(&output.ids_slice * hop),
                self.segment_size,
            );
            (y, y_mel, mel)
        });
        let y_hat_mel = self
            .transform
            .mel_spectrogram(&output.y_hat.to_kind(Kind::Float));

        PairedForward {
            output,
            y,
            y_mel,
            y_hat_mel,
            mel,
        }
    }

    /// Scores the real slice against the detached generated slice and updates
    /// the discriminator. No gradient reaches the generator.
    pub fn discriminator_step(
        &mut self,
        paired: &PairedForward,
    ) -> Result<DiscriminatorReport, CollectiveError> {
        let y_hat = paired.output.y_hat.detach().to_kind(Kind::Float);
        let scores = tch::autocast(self.autocast, || {
            self.discriminator.forward(&paired.y, &y_hat)
        });
        let (loss, real_losses, fake_losses) = discriminator_loss(&scores.real, &scores.fake);

        self.optim_d.zero_grad();
        self.scaler.scale(&loss).backward();
        self.synchronize_gradients(Role::Discriminator)?;
        let unscaled = self.scaler.unscale(&self.optim_d);
        let grad_norm = self.optim_d.clip_grad_value(self.grad_clip);
        let applied = self.scaler.step(&mut self.optim_d, unscaled);

        Ok(DiscriminatorReport {
            loss: loss.double_value(&[]),
            real_losses,
            fake_losses,
            grad_norm,
            applied,
        })
    }

    /// Scores the generated slice with gradients flowing back into the
    /// generator, updates it and then the loss scale.
    pub fn generator_step(
        &mut self,
        paired: PairedForward,
        discriminator: DiscriminatorReport,
    ) -> Result<StepOutput, CollectiveError> {
        let out = &paired.output;
        let y_hat = out.y_hat.to_kind(Kind::Float);
        let scores = tch::autocast(self.autocast, || {
            self.discriminator.forward(&paired.y, &y_hat)
        });

        let loss_dur = out.l_length.to_kind(Kind::Float).sum(Kind::Float);
        let loss_mel = mel_loss(&paired.y_mel, &paired.y_hat_mel) * self.c_mel;
        let loss_kl = kl_loss(&out.z_p, &out.logs_q, &out.m_p, &out.logs_p, &out.z_mask) * self.c_kl;
        let loss_fm = feature_loss(&scores.fmap_real, &scores.fmap_fake);
        let (loss_gen, per_discriminator) = generator_loss(&scores.fake);
        let loss_total = &loss_gen + &loss_fm + &loss_mel + &loss_dur + &loss_kl;

        self.optim_g.zero_grad();
        self.scaler.scale(&loss_total).backward();
        self.synchronize_gradients(Role::Generator)?;
        let unscaled = self.scaler.unscale(&self.optim_g);
        let grad_norm = self.optim_g.clip_grad_value(self.grad_clip);
        let applied = self.scaler.step(&mut self.optim_g, unscaled);
        self.scaler.update();

        let generator = GeneratorReport {
            loss: loss_total.double_value(&[]),
            adversarial: loss_gen.double_value(&[]),
            per_discriminator,
            feature_matching: loss_fm.double_value(&[]),
            mel: loss_mel.double_value(&[]),
            duration: loss_dur.double_value(&[]),
            kl: loss_kl.double_value(&[]),
            grad_norm,
            applied,
        };
        let visuals = StepVisuals {
            y_mel: paired.y_mel.get(0).detach(),
            y_hat_mel: paired.y_hat_mel.get(0).detach(),
            mel: paired.mel.get(0).detach(),
            attn: out.attn.get(0).get(0).detach(),
        };
        Ok(StepOutput {
            discriminator,
            generator,
            visuals,
        })
    }

    /// The full protocol for one batch.
    pub fn step(&mut self, batch: &TrainingBatch) -> Result<StepOutput, CollectiveError> {
        let paired = self.forward(batch);
        let report = self.discriminator_step(&paired)?;
        self.generator_step(paired, report)
    }
}

impl<G, D> std::fmt::Debug for TrainingStep<G, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingStep")
            .field("optim_g", &self.optim_g)
            .field("optim_d", &self.optim_d)
            .field("scaler", &self.scaler)
            .field("comm", &self.comm)
            .finish_non_exhaustive()
    }
}
