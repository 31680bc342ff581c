use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};
use pretty_assertions::assert_eq;
use vits_core::DataConfig;
use vits_data_provider::{BucketedShardSampler, TextAudioSpeakerDataset};

const HOP: usize = 16;
const BOUNDARIES: [usize; 4] = [2, 8, 16, 32];

fn data_config(dir: &Path) -> DataConfig {
    DataConfig {
        training_files: dir.join("train.txt"),
        validation_files: dir.join("val.txt"),
        sampling_rate: 8000,
        filter_length: 64,
        hop_length: HOP as i64,
        win_length: 64,
        n_mel_channels: 8,
        mel_fmin: 0.0,
        mel_fmax: None,
        n_speakers: 3,
        max_wav_value: 32768.0,
        min_text_len: 1,
        max_text_len: 190,
        n_symbols: 20,
    }
}

fn write_wav(path: &Path, frames: usize) {
    let spec = WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    for i in 0..frames * HOP {
        writer.write_sample((i % 100) as i16).unwrap();
    }
    writer.finalize().unwrap();
}

/// Twelve clips spread over three buckets, one too long for any bucket.
fn fixture(dir: &Path) -> DataConfig {
    let frames = [4, 5, 6, 7, 10, 11, 12, 14, 20, 24, 28, 30, 40];
    let mut filelist = String::new();
    for (i, f) in frames.iter().enumerate() {
        let name = format!("clip{i}.wav");
        write_wav(&dir.join(&name), *f);
        filelist.push_str(&format!("{name}|{}|1 2 3 {}\n", i % 3, i % 20));
    }
    std::fs::write(dir.join("train.txt"), filelist).unwrap();
    data_config(dir)
}

#[test]
fn shards_cover_dataset_with_equal_batch_counts() {
    let dir = tempfile::tempdir().unwrap();
    let config = fixture(dir.path());
    let dataset = TextAudioSpeakerDataset::from_filelist(&config.training_files, &config).unwrap();
    assert_eq!(dataset.len(), 13);

    let mut per_rank = Vec::new();
    let mut seen = Vec::new();
    for rank in 0..2 {
        let mut sampler =
            BucketedShardSampler::new(dataset.lengths(), 2, &BOUNDARIES, 2, rank, true, 1234)
                .unwrap();
        sampler.set_epoch(1);
        let batches = sampler.batches();
        per_rank.push(batches.len());
        for batch in &batches {
            let samples = dataset.get_many(batch).unwrap();
            let collated = dataset.collate(&samples).unwrap();
            assert_eq!(collated.batch_size, 2);
            assert!(collated.audio_lengths[0] >= collated.audio_lengths[1]);
            seen.extend(batch.iter().copied());
        }
    }
    assert_eq!(per_rank[0], per_rank[1]);

    seen.sort();
    seen.dedup();
    // the 40 frame clip is longer than the last boundary
    assert_eq!(seen, (0..12).collect::<Vec<_>>());
}

#[test]
fn collated_pitch_matches_frame_count() {
    let dir = tempfile::tempdir().unwrap();
    let config = fixture(dir.path());
    let dataset = TextAudioSpeakerDataset::from_filelist(&config.training_files, &config).unwrap();
    let samples = dataset.get_many(&[0, 8]).unwrap();
    let batch = dataset.collate(&samples).unwrap();
    assert_eq!(batch.max_frames, 20);
    assert_eq!(batch.pitch.len(), 2 * 20);
    assert_eq!(batch.audio_lengths, vec![20 * HOP as i64, 4 * HOP as i64]);
}
