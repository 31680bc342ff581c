//! Where the leader sends scalars, spectrogram images and audio clips.
//!
//! [`FileSink`] appends one JSON line per [`Summary`] to `metrics.jsonl` and
//! writes the artifacts next to it: images as 8-bit grayscale PNG, audio as
//! 16-bit WAV.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};
use image::GrayImage;
use tch::{Device, Kind, Tensor};
use thiserror::Error;

pub const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics I/O: {0}")]
    Io(#[from] io::Error),

    #[error("metrics record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("writing audio: {0}")]
    Wav(#[from] hound::Error),

    #[error("writing image: {0}")]
    Png(#[from] image::ImageError),

    #[error("reading tensor: {0}")]
    Tensor(#[from] tch::TchError),

    #[error("expected a 2-D image, got shape {0:?}")]
    NotAnImage(Vec<i64>),
}

/// Row-major 2-D array, row 0 first.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl Image {
    /// Takes a `[height, width]` tensor. Either side may be 1.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self, MetricsError> {
        let [height, width] = tensor.size()[..] else {
            return Err(MetricsError::NotAnImage(tensor.size()));
        };
        let flat = tensor
            .detach()
            .to_kind(Kind::Float)
            .to_device(Device::Cpu)
            .reshape([-1]);
        Ok(Self {
            height: height as usize,
            width: width as usize,
            data: Vec::<f32>::try_from(&flat)?,
        })
    }

    /// Min/max normalized grayscale, first row at the bottom.
    pub fn to_gray(&self) -> Result<GrayImage, MetricsError> {
        let (lo, hi) = self
            .data
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
        let range = if hi > lo { hi - lo } else { 1.0 };
        let pixels: Vec<u8> = self
            .data
            .chunks(self.width.max(1))
            .rev()
            .flatten()
            .map(|v| {
                let v = if v.is_finite() { (v - lo) / range } else { 0.0 };
                (v.clamp(0.0, 1.0) * 255.0).round() as u8
            })
            .collect();
        GrayImage::from_raw(self.width as u32, self.height as u32, pixels)
            .ok_or_else(|| MetricsError::NotAnImage(vec![self.height as i64, self.width as i64]))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Audio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Audio {
    pub fn from_tensor(tensor: &Tensor, sample_rate: u32) -> Result<Self, MetricsError> {
        let flat = tensor
            .detach()
            .to_kind(Kind::Float)
            .to_device(Device::Cpu)
            .reshape([-1]);
        Ok(Self {
            samples: Vec::<f32>::try_from(&flat)?,
            sample_rate,
        })
    }
}

/// Everything reported for one step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Summary {
    pub step: u64,
    pub scalars: BTreeMap<String, f64>,
    pub images: BTreeMap<String, Image>,
    pub audios: BTreeMap<String, Audio>,
}

impl Summary {
    pub fn new(step: u64) -> Self {
        Self {
            step,
            ..Default::default()
        }
    }

    pub fn scalar(mut self, name: impl Into<String>, value: f64) -> Self {
        self.scalars.insert(name.into(), value);
        self
    }

    pub fn image(mut self, name: impl Into<String>, image: Image) -> Self {
        self.images.insert(name.into(), image);
        self
    }

    pub fn audio(mut self, name: impl Into<String>, audio: Audio) -> Self {
        self.audios.insert(name.into(), audio);
        self
    }
}

pub trait MetricsSink: Send {
    fn summarize(&mut self, summary: &Summary) -> Result<(), MetricsError>;

    fn flush(&mut self) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// The JSON line written for a [`Summary`]; artifacts are referenced by path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub step: u64,
    pub timestamp_ms: u64,
    pub scalars: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub images: BTreeMap<String, PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub audios: BTreeMap<String, PathBuf>,
}

pub struct FileSink {
    dir: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, MetricsError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(METRICS_FILE))?;
        Ok(Self {
            dir,
            writer: BufWriter::new(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn artifact_path(&self, name: &str, step: u64, extension: &str) -> PathBuf {
        let name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}_{step}.{extension}"))
    }
}

impl MetricsSink for FileSink {
    fn summarize(&mut self, summary: &Summary) -> Result<(), MetricsError> {
        let mut images = BTreeMap::new();
        for (name, image) in &summary.images {
            let path = self.artifact_path(name, summary.step, "png");
            image.to_gray()?.save(&path)?;
            images.insert(name.clone(), path);
        }

        let mut audios = BTreeMap::new();
        for (name, audio) in &summary.audios {
            let path = self.artifact_path(name, summary.step, "wav");
            let spec = hound::WavSpec {
                channels: 1,
                sample_rate: audio.sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut wav = hound::WavWriter::create(&path, spec)?;
            for sample in &audio.samples {
                wav.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
            }
            wav.finalize()?;
            audios.insert(name.clone(), path);
        }

        let record = SummaryRecord {
            step: summary.step,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            scalars: summary.scalars.clone(),
            images,
            audios,
        };
        writeln!(self.writer, "{}", serde_json::to_string(&record)?)?;
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), MetricsError> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Keeps summaries in memory. Clones share the same records.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Summary>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Summary> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl MetricsSink for MemorySink {
    fn summarize(&mut self, summary: &Summary) -> Result<(), MetricsError> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(summary.clone());
        Ok(())
    }
}

pub fn load_records(path: impl AsRef<Path>) -> Result<Vec<SummaryRecord>, MetricsError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            records.push(serde_json::from_str(&line)?);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn file_sink_writes_record_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path()).unwrap();
        let mel = Tensor::arange(6, (Kind::Float, Device::Cpu)).view([2, 3]);
        let summary = Summary::new(7)
            .scalar("loss/g/total", 1.5)
            .image("slice/mel_org", Image::from_tensor(&mel).unwrap())
            .audio(
                "gen/audio",
                Audio {
                    samples: vec![0.0, 0.5, -1.5],
                    sample_rate: 16000,
                },
            );
        sink.summarize(&summary).unwrap();

        let records = load_records(dir.path().join(METRICS_FILE)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].step, 7);
        assert_eq!(records[0].scalars["loss/g/total"], 1.5);

        let png = image::open(&records[0].images["slice/mel_org"])
            .unwrap()
            .into_luma8();
        assert_eq!(png.dimensions(), (3, 2));
        // last row is drawn at the top
        assert_eq!(png.into_raw(), vec![153, 204, 255, 0, 51, 102]);

        let wav = hound::WavReader::open(&records[0].audios["gen/audio"]).unwrap();
        let samples: Vec<i16> = wav.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, 16383, -32767]);
    }

    #[test]
    fn image_rejects_non_2d() {
        let t = Tensor::zeros([2, 2, 2], (Kind::Float, Device::Cpu));
        assert!(matches!(Image::from_tensor(&t), Err(MetricsError::NotAnImage(_))));
        let t = Tensor::zeros([1, 2, 3], (Kind::Float, Device::Cpu));
        assert!(matches!(Image::from_tensor(&t), Err(MetricsError::NotAnImage(_))));
    }

    #[test]
    fn single_column_image_is_kept() {
        // a one-token alignment is `[frames, 1]`
        let attn = Tensor::ones([5, 1], (Kind::Float, Device::Cpu));
        let image = Image::from_tensor(&attn).unwrap();
        assert_eq!((image.height, image.width), (5, 1));
        assert_eq!(image.to_gray().unwrap().dimensions(), (1, 5));

        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path()).unwrap();
        sink.summarize(&Summary::new(0).image("all/attn", image))
            .unwrap();
        let records = load_records(dir.path().join(METRICS_FILE)).unwrap();
        assert!(records[0].images["all/attn"].exists());
    }

    #[test]
    fn memory_sink_clones_share_records() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.summarize(&Summary::new(3).scalar("a", 1.0)).unwrap();
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.records()[0].step, 3);
    }
}
