use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Shuffle {
    #[default]
    DontShuffle,
    Seeded([u8; 32]),
}

impl Shuffle {
    /// Expands the configured `train.seed` into a 32 byte seed.
    pub fn from_seed(seed: u64) -> Self {
        let mut array = [0u8; 32];
        array[24..32].copy_from_slice(&seed.to_be_bytes());
        Shuffle::Seeded(array)
    }

    /// RNG for one epoch. Every rank that shares the seed gets the same stream.
    pub fn rng_for_epoch(&self, epoch: u64) -> Option<ChaCha8Rng> {
        match self {
            Shuffle::DontShuffle => None,
            Shuffle::Seeded(seed) => {
                let mut seed = *seed;
                // the epoch occupies bytes that `from_seed` leaves at zero
                for (byte, epoch_byte) in seed[16..24].iter_mut().zip(epoch.to_be_bytes()) {
                    *byte ^= epoch_byte;
                }
                Some(ChaCha8Rng::from_seed(seed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn same_seed_and_epoch_give_same_stream() {
        let a: u64 = Shuffle::from_seed(1234).rng_for_epoch(3).unwrap().random();
        let b: u64 = Shuffle::from_seed(1234).rng_for_epoch(3).unwrap().random();
        assert_eq!(a, b);
    }

    #[test]
    fn epochs_differ() {
        let shuffle = Shuffle::from_seed(1234);
        let a: u64 = shuffle.rng_for_epoch(1).unwrap().random();
        let b: u64 = shuffle.rng_for_epoch(2).unwrap().random();
        assert_ne!(a, b);
    }

    #[test]
    fn dont_shuffle_has_no_rng() {
        assert!(Shuffle::DontShuffle.rng_for_epoch(0).is_none());
    }
}
