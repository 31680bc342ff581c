use tch::{Device, Kind, Tensor};
use vits_core::HParams;
use vits_data_provider::BatchCpu;

use crate::{SpectralTransform, TrainingBatch};

const TINY: &str = r#"{
    "train": {
        "log_interval": 1,
        "eval_interval": 2,
        "seed": 1234,
        "epochs": 2,
        "learning_rate": 2e-4,
        "betas": [0.8, 0.99],
        "eps": 1e-9,
        "batch_size": 2,
        "fp16_run": false,
        "lr_decay": 0.5,
        "segment_size": 64,
        "c_mel": 45,
        "c_kl": 1.0,
        "bucket_boundaries": [1, 64, 256],
        "eval_max_len": 16
    },
    "data": {
        "training_files": "train.txt",
        "validation_files": "val.txt",
        "sampling_rate": 16000,
        "filter_length": 64,
        "hop_length": 16,
        "win_length": 64,
        "n_mel_channels": 8,
        "mel_fmin": 0.0,
        "mel_fmax": null,
        "n_speakers": 2,
        "n_symbols": 10
    },
    "model": {
        "inter_channels": 8,
        "hidden_channels": 8,
        "filter_channels": 16,
        "kernel_size": 3,
        "p_dropout": 0.0,
        "upsample_rates": [4, 4],
        "upsample_initial_channel": 16,
        "upsample_kernel_sizes": [8, 8],
        "gin_channels": 4,
        "discriminator_channels": 64
    }
}"#;

/// A model small enough to train a step on the CPU in a test.
pub(crate) fn tiny_hparams() -> HParams {
    HParams::from_json_str(TINY).unwrap()
}

/// Two rows of noise, 128 and 96 samples long, both longer than one segment.
pub(crate) fn tiny_batch(hparams: &HParams, device: Device) -> TrainingBatch {
    let transform = SpectralTransform::new(&hparams.data, device);
    let hop = hparams.data.hop_length as usize;
    let max_audio = 128;
    let max_frames = max_audio / hop;
    let audio = Tensor::rand([2 * max_audio as i64], (Kind::Float, Device::Cpu)) * 0.2 - 0.1;
    let mut audio = Vec::<f32>::try_from(&audio).unwrap();
    // zero the padding of the shorter row
    audio[max_audio + 96..].iter_mut().for_each(|s| *s = 0.0);
    let cpu = BatchCpu {
        batch_size: 2,
        tokens: vec![1, 2, 3, 4, 5, 6, 7, 8, 0, 0],
        token_lengths: vec![5, 3],
        max_tokens: 5,
        audio,
        audio_lengths: vec![128, 96],
        max_audio,
        pitch: vec![120.0; 2 * max_frames],
        max_frames,
        speakers: vec![0, 1],
    };
    TrainingBatch::from_cpu(&cpu, device, &transform)
}
