use itertools::Itertools;
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::debug;
use vits_core::Shuffle;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SamplerError {
    #[error("batch size must be positive")]
    ZeroBatchSize,

    #[error("rank {rank} is outside a group of {num_replicas}")]
    BadRank { rank: usize, num_replicas: usize },

    #[error("bucket boundaries must be strictly ascending with at least two entries")]
    BadBoundaries,

    #[error("no example fits any bucket")]
    Empty,
}

/// Length-bucketed batch sampler sharded across ranks.
///
/// Bucket `i` holds examples with `boundaries[i] < length <= boundaries[i + 1]`.
/// Each bucket is padded by wrap-around repetition up to a multiple of
/// `batch_size * num_replicas`, so every rank sees the same number of batches.
#[derive(Debug, Clone)]
pub struct BucketedShardSampler {
    buckets: Vec<Vec<usize>>,
    boundaries: Vec<usize>,
    samples_per_bucket: Vec<usize>,
    batch_size: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: Shuffle,
    epoch: u64,
}

impl BucketedShardSampler {
    pub fn new(
        lengths: &[usize],
        batch_size: usize,
        boundaries: &[usize],
        num_replicas: usize,
        rank: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self, SamplerError> {
        if batch_size == 0 {
            return Err(SamplerError::ZeroBatchSize);
        }
        if num_replicas == 0 || rank >= num_replicas {
            return Err(SamplerError::BadRank { rank, num_replicas });
        }
        if boundaries.len() < 2 || boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(SamplerError::BadBoundaries);
        }

        let mut buckets = vec![Vec::new(); boundaries.len() - 1];
        let mut excluded = 0usize;
        for (index, &length) in lengths.iter().enumerate() {
            match bucket_index(boundaries, length) {
                Some(bucket) => buckets[bucket].push(index),
                None => excluded += 1,
            }
        }

        // empty buckets are dropped together with their upper boundary
        let mut kept_boundaries = vec![boundaries[0]];
        let mut kept_buckets = Vec::new();
        for (bucket, upper) in buckets.into_iter().zip(&boundaries[1..]) {
            if !bucket.is_empty() {
                kept_boundaries.push(*upper);
                kept_buckets.push(bucket);
            }
        }
        if kept_buckets.is_empty() {
            return Err(SamplerError::Empty);
        }
        if excluded > 0 {
            debug!(excluded, "Examples outside every bucket were excluded");
        }

        let total_batch_size = batch_size * num_replicas;
        let samples_per_bucket = kept_buckets
            .iter()
            .map(|bucket| {
                let len = bucket.len();
                len + (total_batch_size - len % total_batch_size) % total_batch_size
            })
            .collect();

        Ok(Self {
            buckets: kept_buckets,
            boundaries: kept_boundaries,
            samples_per_bucket,
            batch_size,
            num_replicas,
            rank,
            shuffle: if shuffle {
                Shuffle::from_seed(seed)
            } else {
                Shuffle::DontShuffle
            },
            epoch: 0,
        })
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Boundaries that still delimit a non-empty bucket.
    pub fn boundaries(&self) -> &[usize] {
        &self.boundaries
    }

    pub fn buckets(&self) -> &[Vec<usize>] {
        &self.buckets
    }

    /// Examples this rank visits per epoch, padding included.
    pub fn num_samples(&self) -> usize {
        self.samples_per_bucket.iter().sum::<usize>() / self.num_replicas
    }

    /// Batches per epoch. Identical on every rank.
    pub fn len(&self) -> usize {
        self.num_samples() / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// This rank's batches for the current epoch, as dataset indices.
    pub fn batches(&self) -> Vec<Vec<usize>> {
        let mut rng = self.shuffle.rng_for_epoch(self.epoch);
        let mut batches = Vec::with_capacity(self.len());

        for (bucket, &padded_len) in self.buckets.iter().zip(&self.samples_per_bucket) {
            let mut order = (0..bucket.len()).collect_vec();
            if let Some(rng) = rng.as_mut() {
                order.shuffle(rng);
            }

            let padded = order.iter().copied().cycle().take(padded_len);
            let shard = padded
                .skip(self.rank)
                .step_by(self.num_replicas)
                .map(|position| bucket[position])
                .collect_vec();
            batches.extend(shard.chunks(self.batch_size).map(<[usize]>::to_vec));
        }

        if let Some(rng) = rng.as_mut() {
            batches.shuffle(rng);
        }
        batches
    }
}

fn bucket_index(boundaries: &[usize], length: usize) -> Option<usize> {
    boundaries
        .windows(2)
        .position(|w| w[0] < length && length <= w[1])
}
