mod dataset;
mod sampler;

pub use dataset::{BatchCpu, DatasetError, FilelistEntry, Sample, TextAudioSpeakerDataset};
pub use sampler::{BucketedShardSampler, SamplerError};
