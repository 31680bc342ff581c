use tch::Device;
use vits_core::HParams;
use vits_data_provider::BatchCpu;
use vits_modeling::{SpectralTransform, TrainingBatch};

pub(crate) const TINY: &str = r#"{
    "train": {
        "log_interval": 1,
        "eval_interval": 2,
        "seed": 1234,
        "epochs": 2,
        "learning_rate": 2e-4,
        "betas": [0.8, 0.99],
        "eps": 1e-9,
        "batch_size": 2,
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

pub(crate) fn tiny_hparams() -> HParams {
    HParams::from_json_str(TINY).unwrap()
}

/// Two rows of a ramp, 128 and 96 samples long.
pub(crate) fn tiny_batch(transform: &SpectralTransform) -> TrainingBatch {
    batch_with_tokens(transform, vec![1, 2, 3, 4, 5, 6, 7, 8, 0, 0], vec![5, 3])
}

/// Same audio as [`tiny_batch`], every row a single token.
pub(crate) fn one_token_batch(transform: &SpectralTransform) -> TrainingBatch {
    batch_with_tokens(transform, vec![4, 7], vec![1, 1])
}

fn batch_with_tokens(
    transform: &SpectralTransform,
    tokens: Vec<i64>,
    token_lengths: Vec<i64>,
) -> TrainingBatch {
    let max_tokens = token_lengths.iter().copied().max().unwrap_or(0) as usize;
    let max_audio = 128;
    let mut audio: Vec<f32> = (0..2 * max_audio).map(|i| (i % 32) as f32 / 64.0).collect();
    audio[max_audio + 96..].iter_mut().for_each(|s| *s = 0.0);
    let cpu = BatchCpu {
        batch_size: 2,
        tokens,
        token_lengths,
        max_tokens,
        audio,
        audio_lengths: vec![128, 96],
        max_audio,
        pitch: vec![120.0; 16],
        max_frames: 8,
        speakers: vec![0, 1],
    };
    TrainingBatch::from_cpu(&cpu, Device::Cpu, transform)
}
