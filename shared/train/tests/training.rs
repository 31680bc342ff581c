use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use hound::{SampleFormat, WavSpec, WavWriter};
use pretty_assertions::assert_eq;
use tch::Device;
use tokio_util::sync::CancellationToken;
use vits_core::HParams;
use vits_data_provider::TextAudioSpeakerDataset;
use vits_modeling::{
    metrics::{load_records, MemorySink, METRICS_FILE},
    CheckpointStore, Role,
};
use vits_train::{
    BatchLoader, EvaluationHarness, Leader, Orchestrator, ProcessGroupBootstrap, RunOptions, TrainingContext,
};

const HOP: usize = 16;

fn write_wav(path: &Path, frames: usize) {
    let spec = WavSpec {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    for i in 0..frames * HOP {
        let phase = i as f32 * 440.0 * std::f32::consts::TAU / 16000.0;
        writer.write_sample((phase.sin() * 8000.0) as i16).unwrap();
    }
    writer.finalize().unwrap();
}

/// Four short clips for training and one for evaluation.
fn hparams(dir: &Path, epochs: usize) -> HParams {
    let mut train = String::new();
    for (i, frames) in [8, 10, 12, 14].iter().enumerate() {
        let name = format!("clip{i}.wav");
        write_wav(&dir.join(&name), *frames);
        train.push_str(&format!("{name}|{}|1 2 3 {}\n", i % 2, i + 4));
    }
    std::fs::write(dir.join("train.txt"), train).unwrap();
    write_wav(&dir.join("held_out.wav"), 9);
    std::fs::write(dir.join("val.txt"), "held_out.wav|1|3 2 1\n").unwrap();

    let config = r#"{
        "train": {
            "log_interval": 1,
            "eval_interval": 2,
            "seed": 1234,
            "epochs": EPOCHS,
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
            "training_files": "TRAIN",
            "validation_files": "VAL",
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
    }"#
    .replace("EPOCHS", &epochs.to_string())
    .replace("TRAIN", &dir.join("train.txt").display().to_string())
    .replace("VAL", &dir.join("val.txt").display().to_string());
    HParams::from_json_str(&config).unwrap()
}

#[test]
fn loader_keeps_batch_order_and_stops_when_dropped() {
    let data = tempfile::tempdir().unwrap();
    let hparams = hparams(data.path(), 1);
    let dataset = Arc::new(
        TextAudioSpeakerDataset::from_filelist(&hparams.data.training_files, &hparams.data)
            .unwrap(),
    );

    let batches = vec![vec![3, 0], vec![1], vec![2, 1]];
    let sizes: Vec<usize> = BatchLoader::spawn(dataset.clone(), batches, 1)
        .map(|batch| batch.unwrap().batch_size)
        .collect();
    assert_eq!(sizes, vec![2, 1, 2]);

    // the reader is blocked on a full channel when this is dropped
    let mut loader = BatchLoader::spawn(dataset.clone(), vec![vec![0]; 16], 1);
    assert!(loader.next().is_some());
    drop(loader);

    let mut failing = BatchLoader::spawn(dataset, vec![vec![0], vec![99], vec![1]], 4);
    assert!(failing.next().unwrap().is_ok());
    assert!(failing.next().unwrap().is_err());
    assert!(failing.next().is_none());
}

fn train(
    hparams: HParams,
    model_dir: &Path,
    devices: Vec<Device>,
    cancel: CancellationToken,
) -> Vec<TrainingContext> {
    let bootstrap =
        ProcessGroupBootstrap::from_devices(devices, hparams.train.seed).with_rendezvous("127.0.0.1:0");
    let orchestrator = Orchestrator::new(hparams, RunOptions::new(model_dir), cancel);
    bootstrap
        .launch(move |worker| orchestrator.run(worker))
        .unwrap()
}

fn steps(model_dir: &Path, role: Role) -> Vec<u64> {
    CheckpointStore::new(model_dir).steps(role).unwrap()
}

fn logged_steps(path: PathBuf) -> Vec<u64> {
    load_records(path).unwrap().iter().map(|r| r.step).collect()
}

#[test]
fn two_epochs_on_one_rank() {
    let data = tempfile::tempdir().unwrap();
    let model_dir = data.path().join("model");
    let ends = train(
        hparams(data.path(), 2),
        &model_dir,
        vec![Device::Cpu],
        CancellationToken::new(),
    );

    assert_eq!(
        ends,
        vec![TrainingContext {
            epoch: 2,
            global_step: 4
        }]
    );
    assert_eq!(steps(&model_dir, Role::Generator), vec![0, 2]);
    assert_eq!(steps(&model_dir, Role::Discriminator), vec![0, 2]);
    assert_eq!(logged_steps(model_dir.join(METRICS_FILE)), vec![0, 1, 2, 3]);

    let eval = load_records(model_dir.join("eval").join(METRICS_FILE)).unwrap();
    assert_eq!(eval.iter().map(|r| r.step).collect::<Vec<_>>(), vec![0, 2]);
    assert!(eval[0].audios.contains_key("gt/audio"));
    assert!(!eval[1].audios.contains_key("gt/audio"));
    for path in eval.iter().flat_map(|r| r.audios.values()) {
        assert!(path.exists(), "{} missing", path.display());
    }

    let first = &load_records(model_dir.join(METRICS_FILE)).unwrap()[0];
    assert_eq!(first.scalars["learning_rate"], 2e-4);
    assert!(first.scalars["loss/g/total"].is_finite());
    assert!(first.images.contains_key("slice/mel_org"));
}

#[test]
fn resumes_from_the_saved_epoch() {
    let data = tempfile::tempdir().unwrap();
    let model_dir = data.path().join("model");
    train(
        hparams(data.path(), 2),
        &model_dir,
        vec![Device::Cpu],
        CancellationToken::new(),
    );

    // the step-2 checkpoint was saved in epoch 2, so epoch 2 runs again
    let ends = train(
        hparams(data.path(), 3),
        &model_dir,
        vec![Device::Cpu],
        CancellationToken::new(),
    );
    assert_eq!(
        ends,
        vec![TrainingContext {
            epoch: 3,
            global_step: 6
        }]
    );
    assert_eq!(steps(&model_dir, Role::Generator), vec![0, 2, 4]);
    assert_eq!(
        logged_steps(model_dir.join(METRICS_FILE)),
        vec![0, 1, 2, 3, 2, 3, 4, 5]
    );
}

#[test]
fn cancellation_stops_after_the_epoch() {
    let data = tempfile::tempdir().unwrap();
    let model_dir = data.path().join("model");
    let cancel = CancellationToken::new();
    cancel.cancel();
    let ends = train(hparams(data.path(), 5), &model_dir, vec![Device::Cpu], cancel);
    assert_eq!(
        ends,
        vec![TrainingContext {
            epoch: 1,
            global_step: 2
        }]
    );
}

#[test]
fn two_ranks_split_the_data() {
    let data = tempfile::tempdir().unwrap();
    let model_dir = data.path().join("model");
    let ends = train(
        hparams(data.path(), 2),
        &model_dir,
        vec![Device::Cpu, Device::Cpu],
        CancellationToken::new(),
    );

    // four clips over two ranks is one batch per rank per epoch
    let end = TrainingContext {
        epoch: 2,
        global_step: 2,
    };
    assert_eq!(ends, vec![end, end]);
    assert_eq!(steps(&model_dir, Role::Generator), vec![0]);
    assert_eq!(logged_steps(model_dir.join(METRICS_FILE)), vec![0, 1]);
}

#[test]
fn leader_reports_through_its_sinks() {
    let data = tempfile::tempdir().unwrap();
    let model_dir = data.path().join("model");
    let hparams = hparams(data.path(), 1);
    let validation =
        TextAudioSpeakerDataset::from_filelist(&hparams.data.validation_files, &hparams.data)
            .unwrap();
    let harness = EvaluationHarness::from_dataset(&validation, &hparams, Device::Cpu).unwrap();
    let train_sink = MemorySink::new();
    let eval_sink = MemorySink::new();
    let leader = Arc::new(Mutex::new(Some(Leader::new(
        Box::new(train_sink.clone()),
        Box::new(eval_sink.clone()),
        harness,
    ))));

    let seed = hparams.train.seed;
    let orchestrator = Orchestrator::new(hparams, RunOptions::new(&model_dir), CancellationToken::new());
    let ends = ProcessGroupBootstrap::from_devices(vec![Device::Cpu], seed)
        .launch(move |worker| {
            let leader = leader.lock().unwrap().take();
            orchestrator.run_with_leader(worker, leader)
        })
        .unwrap();

    assert_eq!(
        ends,
        vec![TrainingContext {
            epoch: 1,
            global_step: 2
        }]
    );
    let logged: Vec<u64> = train_sink.records().iter().map(|s| s.step).collect();
    assert_eq!(logged, vec![0, 1]);
    let evaluated: Vec<u64> = eval_sink.records().iter().map(|s| s.step).collect();
    assert_eq!(evaluated, vec![0]);
    // nothing went to the file sinks
    assert!(!model_dir.join(METRICS_FILE).exists());
}
