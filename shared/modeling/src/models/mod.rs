mod discriminator;
mod modules;
mod synthesizer;

use tch::{nn::VarStore, Tensor};

use crate::TrainingBatch;

pub use discriminator::MultiPeriodDiscriminator;
pub use synthesizer::SynthesizerTrn;

/// Everything the paired training forward produces.
#[derive(Debug)]
pub struct GeneratorOutput {
    /// Generated waveform slice, `[B, 1, segment_size]`.
    pub y_hat: Tensor,
    /// Duration predictor loss.
    pub l_length: Tensor,
    /// Frame to token alignment, `[B, 1, frames, tokens]`.
    pub attn: Tensor,
    /// Frame offset of each row's slice.
    pub ids_slice: Tensor,
    pub x_mask: Tensor,
    pub z_mask: Tensor,
    pub z: Tensor,
    pub z_p: Tensor,
    pub m_p: Tensor,
    pub logs_p: Tensor,
    pub m_q: Tensor,
    pub logs_q: Tensor,
}

#[derive(Debug)]
pub struct InferenceOutput {
    /// `[B, 1, samples]`
    pub audio: Tensor,
    pub attn: Tensor,
    pub y_mask: Tensor,
}

#[derive(Debug)]
pub struct DiscriminatorOutput {
    pub real: Vec<Tensor>,
    pub fake: Vec<Tensor>,
    pub fmap_real: Vec<Vec<Tensor>>,
    pub fmap_fake: Vec<Vec<Tensor>>,
}

pub trait SynthesisGenerator {
    fn forward_train(&self, batch: &TrainingBatch) -> GeneratorOutput;

    /// Standalone synthesis from tokens, pitch and speaker, capped at
    /// `max_len` frames when given.
    fn infer(&self, batch: &TrainingBatch, max_len: Option<i64>) -> InferenceOutput;

    fn var_store(&self) -> &VarStore;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;
}

pub trait Discriminator {
    fn forward(&self, y: &Tensor, y_hat: &Tensor) -> DiscriminatorOutput;

    fn var_store(&self) -> &VarStore;
}
