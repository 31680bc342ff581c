//! Leader-only synthesis check on the first held-out example.

use std::ops::Deref;

use tch::{Device, Kind};
use vits_core::HParams;
use vits_data_provider::{DatasetError, TextAudioSpeakerDataset};
use vits_modeling::{
    metrics::{Audio, Image, MetricsError, Summary},
    SpectralTransform, SynthesisGenerator, TrainingBatch,
};

/// Puts the generator in inference mode and back into training mode when
/// dropped, whichever way the evaluation ends.
struct InferenceMode<'a, G: SynthesisGenerator> {
    generator: &'a mut G,
}

impl<'a, G: SynthesisGenerator> InferenceMode<'a, G> {
    fn enter(generator: &'a mut G) -> Self {
        generator.set_training(false);
        Self { generator }
    }
}

impl<G: SynthesisGenerator> Deref for InferenceMode<'_, G> {
    type Target = G;

    fn deref(&self) -> &G {
        self.generator
    }
}

impl<G: SynthesisGenerator> Drop for InferenceMode<'_, G> {
    fn drop(&mut self) {
        self.generator.set_training(true);
    }
}

pub struct EvaluationHarness {
    batch: TrainingBatch,
    transform: SpectralTransform,
    max_len: i64,
    sample_rate: u32,
    hop_length: i64,
}

impl EvaluationHarness {
    /// `batch` is trimmed to its first example.
    pub fn new(batch: &TrainingBatch, hparams: &HParams) -> Self {
        Self {
            batch: batch.first(),
            transform: SpectralTransform::new(&hparams.data, batch.tokens.device()),
            max_len: hparams.train.eval_max_len,
            sample_rate: hparams.data.sampling_rate,
            hop_length: hparams.data.hop_length,
        }
    }

    pub fn from_dataset(
        dataset: &TextAudioSpeakerDataset,
        hparams: &HParams,
        device: Device,
    ) -> Result<Self, DatasetError> {
        let sample = dataset.get(0)?;
        let cpu = dataset.collate(std::slice::from_ref(&sample))?;
        let transform = SpectralTransform::new(&hparams.data, device);
        let batch = TrainingBatch::from_cpu(&cpu, device, &transform);
        Ok(Self::new(&batch, hparams))
    }

    /// Synthesizes the held-out example and returns the generated mel and
    /// audio. At step 0 the ground truth is included as a baseline.
    pub fn evaluate<G: SynthesisGenerator>(
        &self,
        generator: &mut G,
        global_step: u64,
    ) -> Result<Summary, MetricsError> {
        let transform = &self.transform;
        let generator = InferenceMode::enter(generator);
        let _guard = tch::no_grad_guard();

        let out = generator.infer(&self.batch, Some(self.max_len));
        let y_hat_len = out.y_mask.sum(Kind::Int64).int64_value(&[]) * self.hop_length;
        let y_hat = out.audio.narrow(2, 0, y_hat_len.min(out.audio.size()[2]));
        let y_hat_mel = transform.mel_spectrogram(&y_hat.to_kind(Kind::Float));

        let mut summary = Summary::new(global_step)
            .image("gen/mel", Image::from_tensor(&y_hat_mel.get(0))?)
            .audio("gen/audio", Audio::from_tensor(&y_hat.get(0), self.sample_rate)?);

        if global_step == 0 {
            let mel = transform.spec_to_mel(&self.batch.spec);
            summary = summary
                .image("gt/mel", Image::from_tensor(&mel.get(0))?)
                .audio(
                    "gt/audio",
                    Audio::from_tensor(&self.batch.wav.get(0), self.sample_rate)?,
                );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::nn::VarStore;
    use vits_modeling::{GeneratorOutput, InferenceOutput};

    /// Returns silence of a fixed length.
    struct Silence {
        vs: VarStore,
        training: bool,
        frames: i64,
        hop: i64,
    }

    impl SynthesisGenerator for Silence {
        fn forward_train(&self, _batch: &TrainingBatch) -> GeneratorOutput {
            unreachable!("evaluation never trains")
        }

        fn infer(&self, _batch: &TrainingBatch, max_len: Option<i64>) -> InferenceOutput {
            assert!(!self.training);
            let frames = max_len.map_or(self.frames, |m| m.min(self.frames));
            InferenceOutput {
                audio: tch::Tensor::zeros([1, 1, frames * self.hop], (Kind::Float, Device::Cpu)),
                attn: tch::Tensor::zeros([1, 1, frames, 3], (Kind::Float, Device::Cpu)),
                y_mask: tch::Tensor::ones([1, 1, frames], (Kind::Float, Device::Cpu)),
            }
        }

        fn var_store(&self) -> &VarStore {
            &self.vs
        }

        fn set_training(&mut self, training: bool) {
            self.training = training;
        }

        fn is_training(&self) -> bool {
            self.training
        }
    }

    fn harness() -> EvaluationHarness {
        let hparams = crate::test_support::tiny_hparams();
        let transform = SpectralTransform::new(&hparams.data, Device::Cpu);
        let batch = crate::test_support::tiny_batch(&transform);
        EvaluationHarness::new(&batch, &hparams)
    }

    fn silence() -> Silence {
        Silence {
            vs: VarStore::new(Device::Cpu),
            training: true,
            frames: 6,
            hop: 16,
        }
    }

    #[test]
    fn first_evaluation_includes_ground_truth() {
        let harness = harness();
        let mut generator = silence();
        let summary = harness.evaluate(&mut generator, 0).unwrap();
        let images: Vec<_> = summary.images.keys().cloned().collect();
        let audios: Vec<_> = summary.audios.keys().cloned().collect();
        assert_eq!(images, vec!["gen/mel", "gt/mel"]);
        assert_eq!(audios, vec!["gen/audio", "gt/audio"]);
        assert!(generator.is_training());
    }

    #[test]
    fn later_evaluations_emit_only_generated() {
        let harness = harness();
        let mut generator = silence();
        let summary = harness.evaluate(&mut generator, 2).unwrap();
        assert_eq!(summary.step, 2);
        assert_eq!(summary.images.keys().collect::<Vec<_>>(), vec!["gen/mel"]);
        assert_eq!(summary.audios.keys().collect::<Vec<_>>(), vec!["gen/audio"]);
        assert!(generator.is_training());
    }

    #[test]
    fn output_is_capped_at_eval_max_len() {
        let harness = harness();
        let mut generator = Silence {
            frames: 100,
            ..silence()
        };
        let summary = harness.evaluate(&mut generator, 4).unwrap();
        // tiny config caps evaluation at 16 frames of 16 samples
        assert_eq!(summary.audios["gen/audio"].samples.len(), 16 * 16);
    }
}
