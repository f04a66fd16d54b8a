//! Reservoir sampler over partitioned chunk streams.
//!
//! Each partition (one corpus shard) is sampled on its own rayon worker with
//! its own seeded RNG. The partial reservoirs are then merged sequentially in
//! partition order with a dedicated merge RNG, and the merged items are
//! shuffled with that same RNG so that any fixed-offset slice of the result
//! is itself a uniform sample of the stream. Given the seed, the stream order
//! and the partitioning, the result is exactly reproducible.

mod reservoir;
mod split;

pub use reservoir::*;
pub use split::*;

use crate::models::{Chunk, Result, SampledSet};
use crate::source::ChunkSource;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Seeded reservoir sampler.
#[derive(Debug, Clone, Copy)]
pub struct ReservoirSampler {
    capacity: usize,
    seed: u64,
}

impl ReservoirSampler {
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self { capacity, seed }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sample one sequential stream, with the RNG seeded directly by `seed`.
    pub fn sample<T, I>(&self, stream: I) -> Reservoir<T>
    where
        I: IntoIterator<Item = T>,
    {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut reservoir = Reservoir::new(self.capacity);
        reservoir.extend(stream, &mut rng);
        reservoir
    }

    /// Sample a stream consumed as several partitions in parallel.
    ///
    /// `label` namespaces the derived seeds so that different sources do not
    /// share random draws. Items come back in random order: merged
    /// reservoirs keep each partition's picks together, and slot order
    /// inside a reservoir favours early stream items.
    pub fn sample_partitioned<T, I>(&self, label: &str, partitions: Vec<I>) -> Reservoir<T>
    where
        T: Send,
        I: IntoIterator<Item = T> + Send,
    {
        let partials: Vec<Reservoir<T>> = partitions
            .into_par_iter()
            .enumerate()
            .map(|(index, partition)| {
                let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(
                    self.seed,
                    label,
                    &format!("partition-{index}"),
                ));
                let mut reservoir = Reservoir::new(self.capacity);
                reservoir.extend(partition, &mut rng);
                debug!(
                    source = label,
                    partition = index,
                    seen = reservoir.seen(),
                    "Partition sampled"
                );
                reservoir
            })
            .collect();

        // Sequential, order-stated reduction; must stay single-threaded.
        let mut merge_rng = ChaCha8Rng::seed_from_u64(derive_seed(self.seed, label, "merge"));
        let mut merged = partials
            .into_iter()
            .fold(Reservoir::new(self.capacity), |acc, partial| {
                acc.merge(partial, &mut merge_rng)
            });
        merged.shuffle(&mut merge_rng);
        merged
    }
}

/// Derive a stable sub-seed from the run seed and a namespace.
///
/// Uses SHA-256 so the value does not depend on platform or std hasher state.
pub fn derive_seed(seed: u64, label: &str, stream: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(label.as_bytes());
    hasher.update([0x1e]);
    hasher.update(stream.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Sample every labeled corpus under a chunk source.
///
/// Each shard of a label is one partition. Unreadable shards contribute
/// zero chunks.
pub fn sample_corpus(source: &ChunkSource, sampler: &ReservoirSampler) -> Result<SampledSet> {
    let mut sampled = SampledSet::new();

    for (label, shards) in source.shards_by_label()? {
        let partitions: Vec<_> = shards.iter().map(|s| source.stream_shard(s)).collect();
        let reservoir: Reservoir<Chunk> = sampler.sample_partitioned(&label, partitions);

        info!(
            source = %label,
            shards = shards.len(),
            seen = reservoir.seen(),
            sampled = reservoir.len(),
            "Source sampled"
        );
        sampled.insert(label, reservoir.into_items());
    }

    Ok(sampled)
}
