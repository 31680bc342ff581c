use std::{
    fs,
    path::{Path, PathBuf},
};

use hound::{SampleFormat, WavReader};
use itertools::Itertools;
use thiserror::Error;
use tracing::debug;
use vits_core::DataConfig;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to decode wav {path}: {source}")]
    Wav {
        path: PathBuf,
        source: hound::Error,
    },

    #[error("{path}:{line}: {reason}")]
    Filelist {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("{path} has sample rate {found}, expected {expected}")]
    SampleRate {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("{path} has {channels} channels, only mono audio is supported")]
    Channels { path: PathBuf, channels: u16 },

    #[error("bad pitch value {value:?} in {path}")]
    Pitch { path: PathBuf, value: String },

    #[error("index {index} out of range for dataset of {len} examples")]
    OutOfRange { index: usize, len: usize },

    #[error("cannot collate an empty batch")]
    EmptyBatch,
}

/// One parsed line of a filelist: `wav_path|speaker_id|token ids[|pitch_path]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FilelistEntry {
    pub wav_path: PathBuf,
    pub speaker: i64,
    pub tokens: Vec<i64>,
    pub pitch_path: Option<PathBuf>,
    /// Sample count read from the WAV header.
    pub num_samples: usize,
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub tokens: Vec<i64>,
    pub audio: Vec<f32>,
    /// One f0 value per spectrogram frame.
    pub pitch: Vec<f32>,
    pub speaker: i64,
}

/// Zero-padded, row-major batch in host memory.
///
/// Rows are sorted by audio length, longest first.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCpu {
    pub batch_size: usize,
    pub tokens: Vec<i64>,
    pub token_lengths: Vec<i64>,
    pub max_tokens: usize,
    pub audio: Vec<f32>,
    pub audio_lengths: Vec<i64>,
    pub max_audio: usize,
    pub pitch: Vec<f32>,
    pub max_frames: usize,
    pub speakers: Vec<i64>,
}

pub struct TextAudioSpeakerDataset {
    entries: Vec<FilelistEntry>,
    lengths: Vec<usize>,
    sampling_rate: u32,
    hop_length: usize,
    max_wav_value: f32,
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

impl TextAudioSpeakerDataset {
    /// Parses a filelist and reads every WAV header.
    ///
    /// Relative paths are resolved against the filelist's directory. Entries
    /// whose token count falls outside `[min_text_len, max_text_len]` are
    /// skipped.
    pub fn from_filelist(path: impl AsRef<Path>, config: &DataConfig) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or(Path::new("."));
        let hop_length = config.hop_length as usize;

        let mut entries = Vec::new();
        let mut skipped = 0usize;
        for (line_index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let filelist_error = |reason: String| DatasetError::Filelist {
                path: path.to_path_buf(),
                line: line_index + 1,
                reason,
            };
            let fields = line.split('|').collect_vec();
            if !(3..=4).contains(&fields.len()) {
                return Err(filelist_error(format!(
                    "expected 3 or 4 '|' separated fields, got {}",
                    fields.len()
                )));
            }
            let speaker = fields[1]
                .trim()
                .parse::<i64>()
                .map_err(|err| filelist_error(format!("bad speaker id: {err}")))?;
            if speaker < 0 || speaker >= config.n_speakers {
                return Err(filelist_error(format!(
                    "speaker id {speaker} outside [0, {})",
                    config.n_speakers
                )));
            }
            let tokens = fields[2]
                .split_whitespace()
                .map(|token| token.parse::<i64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| filelist_error(format!("bad token id: {err}")))?;
            if let Some(token) = tokens.iter().find(|t| **t < 0 || **t >= config.n_symbols) {
                return Err(filelist_error(format!(
                    "token id {token} outside [0, {})",
                    config.n_symbols
                )));
            }
            if tokens.len() < config.min_text_len || tokens.len() > config.max_text_len {
                skipped += 1;
                continue;
            }

            let wav_path = resolve(base, fields[0].trim());
            let pitch_path = fields
                .get(3)
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(|p| resolve(base, p));

            let reader = WavReader::open(&wav_path).map_err(|source| DatasetError::Wav {
                path: wav_path.clone(),
                source,
            })?;
            let spec = reader.spec();
            if spec.sample_rate != config.sampling_rate {
                return Err(DatasetError::SampleRate {
                    path: wav_path,
                    found: spec.sample_rate,
                    expected: config.sampling_rate,
                });
            }
            if spec.channels != 1 {
                return Err(DatasetError::Channels {
                    path: wav_path,
                    channels: spec.channels,
                });
            }
            let num_samples = reader.duration() as usize;

            entries.push(FilelistEntry {
                wav_path,
                speaker,
                tokens,
                pitch_path,
                num_samples,
            });
        }

        if skipped > 0 {
            debug!(
                filelist = %path.display(),
                skipped,
                "Skipped entries outside the text length filter"
            );
        }
        debug!(
            filelist = %path.display(),
            examples = entries.len(),
            "Loaded filelist"
        );

        let lengths = entries.iter().map(|e| e.num_samples / hop_length).collect();
        Ok(Self {
            entries,
            lengths,
            sampling_rate: config.sampling_rate,
            hop_length,
            max_wav_value: config.max_wav_value,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spectrogram frame count per example, the length measure used for bucketing.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn entries(&self) -> &[FilelistEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Result<Sample, DatasetError> {
        let entry = self.entries.get(index).ok_or(DatasetError::OutOfRange {
            index,
            len: self.entries.len(),
        })?;
        let audio = self.read_audio(&entry.wav_path)?;
        let frames = audio.len() / self.hop_length;
        let pitch = match &entry.pitch_path {
            Some(path) => read_pitch(path, frames)?,
            None => vec![0.0; frames],
        };
        Ok(Sample {
            tokens: entry.tokens.clone(),
            audio,
            pitch,
            speaker: entry.speaker,
        })
    }

    pub fn get_many(&self, indices: &[usize]) -> Result<Vec<Sample>, DatasetError> {
        indices.iter().map(|&i| self.get(i)).collect()
    }

    fn read_audio(&self, path: &Path) -> Result<Vec<f32>, DatasetError> {
        let wav_error = |source| DatasetError::Wav {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = WavReader::open(path).map_err(wav_error)?;
        let spec = reader.spec();
        if spec.sample_rate != self.sampling_rate {
            return Err(DatasetError::SampleRate {
                path: path.to_path_buf(),
                found: spec.sample_rate,
                expected: self.sampling_rate,
            });
        }
        match spec.sample_format {
            SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .map_err(wav_error),
            SampleFormat::Int => {
                let max = self.max_wav_value;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|s| s as f32 / max))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(wav_error)
            }
        }
    }

    /// Sorts by audio length (longest first) and zero-pads every field.
    pub fn collate(&self, samples: &[Sample]) -> Result<BatchCpu, DatasetError> {
        if samples.is_empty() {
            return Err(DatasetError::EmptyBatch);
        }
        let order = (0..samples.len())
            .sorted_by_key(|&i| std::cmp::Reverse(samples[i].audio.len() / self.hop_length))
            .collect_vec();

        let batch_size = samples.len();
        let max_tokens = samples.iter().map(|s| s.tokens.len()).max().unwrap_or(0);
        let max_audio = samples.iter().map(|s| s.audio.len()).max().unwrap_or(0);
        let max_frames = max_audio / self.hop_length;

        let mut batch = BatchCpu {
            batch_size,
            tokens: vec![0; batch_size * max_tokens],
            token_lengths: Vec::with_capacity(batch_size),
            max_tokens,
            audio: vec![0.0; batch_size * max_audio],
            audio_lengths: Vec::with_capacity(batch_size),
            max_audio,
            pitch: vec![0.0; batch_size * max_frames],
            max_frames,
            speakers: Vec::with_capacity(batch_size),
        };
        for (row, &i) in order.iter().enumerate() {
            let sample = &samples[i];
            batch.tokens[row * max_tokens..][..sample.tokens.len()].copy_from_slice(&sample.tokens);
            batch.token_lengths.push(sample.tokens.len() as i64);
            batch.audio[row * max_audio..][..sample.audio.len()].copy_from_slice(&sample.audio);
            batch.audio_lengths.push(sample.audio.len() as i64);
            let pitch = &sample.pitch[..sample.pitch.len().min(max_frames)];
            batch.pitch[row * max_frames..][..pitch.len()].copy_from_slice(pitch);
            batch.speakers.push(sample.speaker);
        }
        Ok(batch)
    }
}

fn read_pitch(path: &Path, frames: usize) -> Result<Vec<f32>, DatasetError> {
    let contents = fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut pitch = contents
        .split_whitespace()
        .map(|value| {
            value.parse::<f32>().map_err(|_| DatasetError::Pitch {
                path: path.to_path_buf(),
                value: value.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    pitch.resize(frames, 0.0);
    Ok(pitch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};
    use pretty_assertions::assert_eq;

    fn config(dir: &Path) -> DataConfig {
        DataConfig {
            training_files: dir.join("train.txt"),
            validation_files: dir.join("val.txt"),
            sampling_rate: 16000,
            filter_length: 64,
            hop_length: 16,
            win_length: 64,
            n_mel_channels: 8,
            mel_fmin: 0.0,
            mel_fmax: None,
            n_speakers: 2,
            max_wav_value: 32768.0,
            min_text_len: 1,
            max_text_len: 190,
            n_symbols: 10,
        }
    }

    fn write_wav(path: &Path, samples: &[i16]) {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn parses_filelist_and_filters_text_length() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("a.wav"), &[16384; 160]);
        write_wav(&dir.path().join("b.wav"), &[0; 320]);
        std::fs::write(dir.path().join("b.f0"), "100 110 120").unwrap();
        std::fs::write(
            dir.path().join("train.txt"),
            "a.wav|0|1 2 3\nb.wav|1|4 5|b.f0\na.wav|0|\n",
        )
        .unwrap();

        let config = config(dir.path());
        let dataset =
            TextAudioSpeakerDataset::from_filelist(&config.training_files, &config).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.lengths(), &[10, 20]);

        let a = dataset.get(0).unwrap();
        assert_eq!(a.audio[0], 0.5);
        assert_eq!(a.pitch, vec![0.0; 10]);

        let b = dataset.get(1).unwrap();
        assert_eq!(b.speaker, 1);
        assert_eq!(&b.pitch[..4], &[100.0, 110.0, 120.0, 0.0]);
        assert_eq!(b.pitch.len(), 20);
    }

    #[test]
    fn collate_sorts_longest_first_and_pads() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("a.wav"), &[100; 32]);
        write_wav(&dir.path().join("b.wav"), &[200; 64]);
        std::fs::write(dir.path().join("train.txt"), "a.wav|0|1 2 3\nb.wav|1|4\n").unwrap();

        let config = config(dir.path());
        let dataset =
            TextAudioSpeakerDataset::from_filelist(&config.training_files, &config).unwrap();
        let samples = dataset.get_many(&[0, 1]).unwrap();
        let batch = dataset.collate(&samples).unwrap();

        assert_eq!(batch.audio_lengths, vec![64, 32]);
        assert_eq!(batch.token_lengths, vec![1, 3]);
        assert_eq!(batch.speakers, vec![1, 0]);
        assert_eq!(batch.max_tokens, 3);
        assert_eq!(batch.tokens, vec![4, 0, 0, 1, 2, 3]);
        assert_eq!(batch.max_frames, 4);
        assert_eq!(batch.audio.len(), 2 * 64);
        assert_eq!(batch.audio[64 + 32], 0.0);
    }

    #[test]
    fn rejects_wrong_sample_rate() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("a.wav"), &[0; 32]);
        std::fs::write(dir.path().join("train.txt"), "a.wav|0|1\n").unwrap();
        let mut config = config(dir.path());
        config.sampling_rate = 22050;
        assert!(matches!(
            TextAudioSpeakerDataset::from_filelist(&config.training_files, &config),
            Err(DatasetError::SampleRate { found: 16000, .. })
        ));
    }

    #[test]
    fn rejects_malformed_line() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("train.txt"), "only-one-field\n").unwrap();
        let config = config(dir.path());
        assert!(matches!(
            TextAudioSpeakerDataset::from_filelist(&config.training_files, &config),
            Err(DatasetError::Filelist { line: 1, .. })
        ));
    }
}
