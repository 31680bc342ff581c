use std::{sync::Arc, thread};

use tracing::trace;
use vits_data_provider::{BatchCpu, DatasetError, TextAudioSpeakerDataset};

/// Reads and collates one epoch's batches on a background thread, `depth`
/// batches ahead of the consumer. Batches arrive in the order given.
pub struct BatchLoader {
    rx: flume::Receiver<Result<BatchCpu, DatasetError>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl BatchLoader {
    pub fn spawn(
        dataset: Arc<TextAudioSpeakerDataset>,
        batches: Vec<Vec<usize>>,
        depth: usize,
    ) -> Self {
        let (tx, rx) = flume::bounded(depth.max(1));
        let handle = thread::spawn(move || {
            for (index, indices) in batches.into_iter().enumerate() {
                let batch = dataset
                    .get_many(&indices)
                    .and_then(|samples| dataset.collate(&samples));
                let failed = batch.is_err();
                if tx.send(batch).is_err() {
                    trace!(index, "Loader stopped early, consumer went away");
                    return;
                }
                if failed {
                    return;
                }
            }
        });
        Self {
            rx,
            handle: Some(handle),
        }
    }
}

impl Iterator for BatchLoader {
    type Item = Result<BatchCpu, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for BatchLoader {
    fn drop(&mut self) {
        // disconnect first so a blocked sender wakes up
        let (_, rx) = flume::bounded(0);
        drop(std::mem::replace(&mut self.rx, rx));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
