use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HParamsError {
    #[error("failed to read hyperparameter file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse hyperparameters: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid hyperparameter {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> HParamsError {
    HParamsError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Audio and dataset parameters (`data.*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub training_files: PathBuf,
    pub validation_files: PathBuf,
    pub sampling_rate: u32,
    pub filter_length: i64,
    pub hop_length: i64,
    pub win_length: i64,
    pub n_mel_channels: i64,
    #[serde(default)]
    pub mel_fmin: f64,
    #[serde(default)]
    pub mel_fmax: Option<f64>,
    #[serde(default = "default_n_speakers")]
    pub n_speakers: i64,
    #[serde(default = "default_max_wav_value")]
    pub max_wav_value: f32,
    #[serde(default = "default_min_text_len")]
    pub min_text_len: usize,
    #[serde(default = "default_max_text_len")]
    pub max_text_len: usize,
    #[serde(default = "default_n_symbols")]
    pub n_symbols: i64,
}

/// Optimization and cadence parameters (`train.*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub segment_size: i64,
    pub epochs: usize,
    pub learning_rate: f64,
    pub betas: [f64; 2],
    pub eps: f64,
    pub lr_decay: f64,
    #[serde(default)]
    pub fp16_run: bool,
    pub c_mel: f64,
    pub c_kl: f64,
    pub log_interval: u64,
    pub eval_interval: u64,
    pub seed: u64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default)]
    pub grad_clip_value: Option<f64>,
    #[serde(default = "default_init_scale")]
    pub init_scale: f64,
    #[serde(default = "default_growth_interval")]
    pub growth_interval: u32,
    #[serde(default = "default_bucket_boundaries")]
    pub bucket_boundaries: Vec<usize>,
    #[serde(default = "default_eval_max_len")]
    pub eval_max_len: i64,
}

/// Architecture parameters for the generator and discriminator (`model.*`).
///
/// Keys the reference architecture does not use are ignored on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub inter_channels: i64,
    pub hidden_channels: i64,
    pub filter_channels: i64,
    pub kernel_size: i64,
    #[serde(default)]
    pub p_dropout: f64,
    pub upsample_rates: Vec<i64>,
    pub upsample_initial_channel: i64,
    pub upsample_kernel_sizes: Vec<i64>,
    #[serde(default = "default_gin_channels")]
    pub gin_channels: i64,
    /// Widest discriminator layer. Narrower widths scale every layer down.
    #[serde(default = "default_discriminator_channels")]
    pub discriminator_channels: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HParams {
    pub data: DataConfig,
    pub train: TrainConfig,
    pub model: ModelConfig,
}

fn default_n_speakers() -> i64 {
    1
}

fn default_max_wav_value() -> f32 {
    32768.0
}

fn default_min_text_len() -> usize {
    1
}

fn default_max_text_len() -> usize {
    190
}

fn default_n_symbols() -> i64 {
    178
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_init_scale() -> f64 {
    65536.0
}

fn default_growth_interval() -> u32 {
    2000
}

fn default_bucket_boundaries() -> Vec<usize> {
    vec![32, 300, 400, 500, 600, 700, 800, 900, 1000]
}

fn default_eval_max_len() -> i64 {
    1000
}

fn default_gin_channels() -> i64 {
    256
}

fn default_discriminator_channels() -> i64 {
    1024
}

impl HParams {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, HParamsError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| HParamsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    /// Parses and validates in one go, so a bad file never reaches a worker.
    pub fn from_json_str(contents: &str) -> Result<Self, HParamsError> {
        let hparams: HParams = serde_json::from_str(contents)?;
        hparams.validate()?;
        Ok(hparams)
    }

    pub fn to_json_pretty(&self) -> Result<String, HParamsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Width, in spectrogram frames, of one training slice.
    pub fn segment_frames(&self) -> i64 {
        self.train.segment_size / self.data.hop_length
    }

    pub fn validate(&self) -> Result<(), HParamsError> {
        let data = &self.data;
        let train = &self.train;
        let model = &self.model;

        for (field, value) in [
            ("data.filter_length", data.filter_length),
            ("data.hop_length", data.hop_length),
            ("data.win_length", data.win_length),
            ("data.n_mel_channels", data.n_mel_channels),
            ("data.n_speakers", data.n_speakers),
            ("data.n_symbols", data.n_symbols),
            ("train.segment_size", train.segment_size),
            ("train.eval_max_len", train.eval_max_len),
            ("model.inter_channels", model.inter_channels),
            ("model.hidden_channels", model.hidden_channels),
            ("model.filter_channels", model.filter_channels),
            ("model.kernel_size", model.kernel_size),
            ("model.upsample_initial_channel", model.upsample_initial_channel),
        ] {
            if value <= 0 {
                return Err(invalid(field, format!("must be positive, got {value}")));
            }
        }
        if data.sampling_rate == 0 {
            return Err(invalid("data.sampling_rate", "must be positive"));
        }
        if data.win_length > data.filter_length {
            return Err(invalid(
                "data.win_length",
                format!(
                    "{} exceeds filter_length {}",
                    data.win_length, data.filter_length
                ),
            ));
        }
        if let Some(fmax) = data.mel_fmax {
            if fmax <= data.mel_fmin {
                return Err(invalid(
                    "data.mel_fmax",
                    format!("{fmax} must be greater than mel_fmin {}", data.mel_fmin),
                ));
            }
        }
        if data.max_wav_value <= 0.0 {
            return Err(invalid("data.max_wav_value", "must be positive"));
        }
        if data.min_text_len > data.max_text_len {
            return Err(invalid(
                "data.min_text_len",
                format!("{} exceeds max_text_len {}", data.min_text_len, data.max_text_len),
            ));
        }

        if train.batch_size == 0 {
            return Err(invalid("train.batch_size", "must be positive"));
        }
        if train.epochs == 0 {
            return Err(invalid("train.epochs", "must be positive"));
        }
        if train.log_interval == 0 {
            return Err(invalid("train.log_interval", "must be positive"));
        }
        if train.eval_interval == 0 {
            return Err(invalid("train.eval_interval", "must be positive"));
        }
        if train.segment_size % data.hop_length != 0 {
            return Err(invalid(
                "train.segment_size",
                format!(
                    "{} is not a multiple of hop_length {}",
                    train.segment_size, data.hop_length
                ),
            ));
        }
        if !(train.learning_rate > 0.0) {
            return Err(invalid("train.learning_rate", "must be positive"));
        }
        if !(train.lr_decay > 0.0 && train.lr_decay <= 1.0) {
            return Err(invalid("train.lr_decay", "must lie in (0, 1]"));
        }
        if train.betas.iter().any(|beta| !(0.0..1.0).contains(beta)) {
            return Err(invalid("train.betas", "each beta must lie in [0, 1)"));
        }
        if !(train.eps > 0.0) {
            return Err(invalid("train.eps", "must be positive"));
        }
        if train.weight_decay < 0.0 {
            return Err(invalid("train.weight_decay", "must not be negative"));
        }
        if let Some(clip) = train.grad_clip_value {
            if !(clip > 0.0) {
                return Err(invalid("train.grad_clip_value", "must be positive"));
            }
        }
        if !(train.init_scale > 0.0) {
            return Err(invalid("train.init_scale", "must be positive"));
        }
        if train.growth_interval == 0 {
            return Err(invalid("train.growth_interval", "must be positive"));
        }
        if train.bucket_boundaries.len() < 2 {
            return Err(invalid(
                "train.bucket_boundaries",
                "needs at least two boundaries",
            ));
        }
        if train.bucket_boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid(
                "train.bucket_boundaries",
                "must be strictly ascending",
            ));
        }

        if model.kernel_size % 2 == 0 {
            return Err(invalid(
                "model.kernel_size",
                format!("{} must be odd", model.kernel_size),
            ));
        }
        if model.inter_channels % 2 != 0 {
            return Err(invalid(
                "model.inter_channels",
                format!("{} must be even", model.inter_channels),
            ));
        }
        if model.upsample_rates.is_empty() {
            return Err(invalid("model.upsample_rates", "must not be empty"));
        }
        if model.upsample_rates.len() != model.upsample_kernel_sizes.len() {
            return Err(invalid(
                "model.upsample_kernel_sizes",
                format!(
                    "has {} entries but upsample_rates has {}",
                    model.upsample_kernel_sizes.len(),
                    model.upsample_rates.len()
                ),
            ));
        }
        let total_upsample: i64 = model.upsample_rates.iter().product();
        if total_upsample != data.hop_length {
            return Err(invalid(
                "model.upsample_rates",
                format!(
                    "product {total_upsample} must equal hop_length {}",
                    data.hop_length
                ),
            ));
        }
        if let Some((rate, kernel)) = model
            .upsample_rates
            .iter()
            .zip(&model.upsample_kernel_sizes)
            .find(|(rate, kernel)| **rate <= 0 || *kernel < *rate || (**kernel - **rate) % 2 != 0)
        {
            return Err(invalid(
                "model.upsample_kernel_sizes",
                format!("kernel {kernel} cannot upsample exactly by {rate}"),
            ));
        }
        if ![64, 128, 256, 512, 1024].contains(&model.discriminator_channels) {
            return Err(invalid(
                "model.discriminator_channels",
                format!(
                    "{} must be one of 64, 128, 256, 512, 1024",
                    model.discriminator_channels
                ),
            ));
        }
        if model.gin_channels < 0 {
            return Err(invalid("model.gin_channels", "must not be negative"));
        }
        if !(0.0..1.0).contains(&model.p_dropout) {
            return Err(invalid("model.p_dropout", "must lie in [0, 1)"));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) const SAMPLE: &str = r#"{
        "train": {
            "log_interval": 200,
            "eval_interval": 1000,
            "seed": 1234,
            "epochs": 10000,
            "learning_rate": 2e-4,
            "betas": [0.8, 0.99],
            "eps": 1e-9,
            "batch_size": 4,
            "fp16_run": true,
            "lr_decay": 0.999875,
            "segment_size": 8192,
            "c_mel": 45,
            "c_kl": 1.0
        },
        "data": {
            "training_files": "filelists/train.txt",
            "validation_files": "filelists/val.txt",
            "max_wav_value": 32768.0,
            "sampling_rate": 22050,
            "filter_length": 1024,
            "hop_length": 256,
            "win_length": 1024,
            "n_mel_channels": 80,
            "mel_fmin": 0.0,
            "mel_fmax": null,
            "n_speakers": 4
        },
        "model": {
            "inter_channels": 192,
            "hidden_channels": 192,
            "filter_channels": 768,
            "n_heads": 2,
            "kernel_size": 3,
            "p_dropout": 0.1,
            "upsample_rates": [8, 8, 2, 2],
            "upsample_initial_channel": 512,
            "upsample_kernel_sizes": [16, 16, 4, 4],
            "gin_channels": 256
        }
    }"#;

    #[test]
    fn parses_reference_config_with_defaults() {
        let hparams = HParams::from_json_str(SAMPLE).unwrap();
        assert_eq!(hparams.train.batch_size, 4);
        assert_eq!(hparams.train.weight_decay, 0.01);
        assert_eq!(hparams.train.grad_clip_value, None);
        assert_eq!(
            hparams.train.bucket_boundaries,
            vec![32, 300, 400, 500, 600, 700, 800, 900, 1000]
        );
        assert_eq!(hparams.data.n_symbols, 178);
        assert_eq!(hparams.segment_frames(), 32);
    }

    #[test]
    fn rejects_segment_not_multiple_of_hop() {
        let mut hparams = HParams::from_json_str(SAMPLE).unwrap();
        hparams.train.segment_size = 8000;
        assert!(matches!(
            hparams.validate(),
            Err(HParamsError::Invalid {
                field: "train.segment_size",
                ..
            })
        ));
    }

    #[test]
    fn rejects_upsampling_that_disagrees_with_hop() {
        let mut hparams = HParams::from_json_str(SAMPLE).unwrap();
        hparams.model.upsample_rates = vec![8, 8, 2];
        hparams.model.upsample_kernel_sizes = vec![16, 16, 4];
        assert!(matches!(
            hparams.validate(),
            Err(HParamsError::Invalid {
                field: "model.upsample_rates",
                ..
            })
        ));
    }

    #[test]
    fn rejects_kernel_that_cannot_upsample_exactly() {
        let mut hparams = HParams::from_json_str(SAMPLE).unwrap();
        hparams.model.upsample_kernel_sizes = vec![16, 15, 4, 4];
        assert!(matches!(
            hparams.validate(),
            Err(HParamsError::Invalid {
                field: "model.upsample_kernel_sizes",
                ..
            })
        ));
    }

    #[test]
    fn rejects_unsorted_boundaries() {
        let mut hparams = HParams::from_json_str(SAMPLE).unwrap();
        hparams.train.bucket_boundaries = vec![32, 400, 300];
        assert!(hparams.validate().is_err());
    }

    #[test]
    fn round_trips_through_file() {
        let hparams = HParams::from_json_str(SAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, hparams.to_json_pretty().unwrap()).unwrap();
        assert_eq!(HParams::from_file(&path).unwrap(), hparams);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        assert!(matches!(
            HParams::from_file("/definitely/not/here.json"),
            Err(HParamsError::Read { .. })
        ));
    }
}
