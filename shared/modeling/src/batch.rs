use tch::{Device, Tensor};
use vits_data_provider::BatchCpu;

use crate::SpectralTransform;

/// A collated batch moved to one device.
///
/// Every field is padded to the longest row; the `*_lengths` tensors hold the
/// valid extent of each row.
#[derive(Debug)]
pub struct TrainingBatch {
    pub tokens: Tensor,
    pub token_lengths: Tensor,
    pub spec: Tensor,
    pub spec_lengths: Tensor,
    pub wav: Tensor,
    pub wav_lengths: Tensor,
    pub pitch: Tensor,
    pub speakers: Tensor,
}

impl TrainingBatch {
    pub fn from_cpu(batch: &BatchCpu, device: Device, transform: &SpectralTransform) -> Self {
        let b = batch.batch_size as i64;
        let tokens = Tensor::from_slice(&batch.tokens)
            .view([b, batch.max_tokens as i64])
            .to_device(device);
        let wav = Tensor::from_slice(&batch.audio)
            .view([b, 1, batch.max_audio as i64])
            .to_device(device);
        let wav_lengths = Tensor::from_slice(&batch.audio_lengths).to_device(device);
        let spec = tch::no_grad(|| transform.spectrogram(&wav));
        let spec_lengths = batch
            .audio_lengths
            .iter()
            .map(|len| len / transform.hop_length())
            .collect::<Vec<_>>();
        let spec_lengths = Tensor::from_slice(&spec_lengths).to_device(device);
        let pitch = Tensor::from_slice(&batch.pitch)
            .view([b, batch.max_frames as i64])
            .to_device(device);

        Self {
            tokens,
            token_lengths: Tensor::from_slice(&batch.token_lengths).to_device(device),
            spec,
            spec_lengths,
            wav,
            wav_lengths,
            pitch,
            speakers: Tensor::from_slice(&batch.speakers).to_device(device),
        }
    }

    pub fn size(&self) -> i64 {
        self.tokens.size()[0]
    }

    /// The first row alone, trimmed to its own lengths.
    pub fn first(&self) -> Self {
        let token_len = self.token_lengths.int64_value(&[0]);
        let spec_len = self.spec_lengths.int64_value(&[0]);
        let wav_len = self.wav_lengths.int64_value(&[0]);
        Self {
            tokens: self.tokens.narrow(0, 0, 1).narrow(1, 0, token_len),
            token_lengths: self.token_lengths.narrow(0, 0, 1),
            spec: self.spec.narrow(0, 0, 1).narrow(2, 0, spec_len),
            spec_lengths: self.spec_lengths.narrow(0, 0, 1),
            wav: self.wav.narrow(0, 0, 1).narrow(2, 0, wav_len),
            wav_lengths: self.wav_lengths.narrow(0, 0, 1),
            pitch: self.pitch.narrow(0, 0, 1).narrow(1, 0, spec_len),
            speakers: self.speakers.narrow(0, 0, 1),
        }
    }
}
