//! Partition selection
//!
//! [`Partitioner::partition`] honors an explicit partition when it is within
//! the topic's partition count and rejects it otherwise; only records without
//! one reach the policy in [`Partitioner::choose`].

use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Records sent to one partition before the sticky partitioner moves on
const STICKY_BATCH_THRESHOLD: usize = 8;

/// Chooses the destination partition of a record
pub trait Partitioner: Send + Sync {
    /// Pick a partition in `0..partition_count` for a record without an explicit one
    fn choose(&self, topic: &str, key: Option<&[u8]>, partition_count: i32) -> i32;

    /// Resolve the destination partition, validating an explicit choice
    fn partition(
        &self,
        topic: &str,
        explicit: Option<i32>,
        key: Option<&[u8]>,
        partition_count: i32,
    ) -> Result<i32> {
        let partition = match explicit {
            Some(p) => p,
            None if partition_count > 0 => self.choose(topic, key, partition_count),
            None => 0,
        };

        if partition < 0 || partition >= partition_count {
            return Err(Error::UnknownPartition {
                topic: topic.to_string(),
                partition,
                partition_count,
            });
        }
        Ok(partition)
    }
}

// ============================================================================
// Murmur2
// ============================================================================

/// Kafka-compatible murmur2 hash (seed 0x9747b28c)
///
/// Matches the Java client's `Utils.murmur2()` so keyed records land on the
/// same partition no matter which client produced them.
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747b28c;
    const M: u32 = 0x5bd1e995;
    const R: u32 = 24;

    let mut h = SEED ^ data.len() as u32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M) ^ k;
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, byte) in tail.iter().enumerate().rev() {
            h ^= (*byte as u32) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^ (h >> 15)
}

/// `toPositive(murmur2(key)) % partition_count`
#[inline]
pub fn murmur2_partition(key: &[u8], partition_count: i32) -> i32 {
    ((murmur2(key) & 0x7fff_ffff) % partition_count as u32) as i32
}

fn random_start(partition_count: i32) -> i32 {
    (rand::random::<u32>() % partition_count as u32) as i32
}

// ============================================================================
// Policies
// ============================================================================

/// Hash keyed records with murmur2; spread keyless records round-robin per topic
#[derive(Default)]
pub struct DefaultPartitioner {
    keyless: RoundRobinPartitioner,
}

impl DefaultPartitioner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Partitioner for DefaultPartitioner {
    fn choose(&self, topic: &str, key: Option<&[u8]>, partition_count: i32) -> i32 {
        match key {
            Some(key) => murmur2_partition(key, partition_count),
            None => self.keyless.choose(topic, None, partition_count),
        }
    }
}

/// Cycles through partitions per topic, ignoring keys
#[derive(Default)]
pub struct RoundRobinPartitioner {
    next: Mutex<HashMap<String, i32>>,
}

impl RoundRobinPartitioner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Partitioner for RoundRobinPartitioner {
    fn choose(&self, topic: &str, _key: Option<&[u8]>, partition_count: i32) -> i32 {
        let mut next = self.next.lock();
        let counter = next
            .entry(topic.to_string())
            .or_insert_with(|| random_start(partition_count));
        let partition = counter.rem_euclid(partition_count);
        *counter = partition.wrapping_add(1);
        partition
    }
}

/// Sticks to one partition for a run of keyless records, then moves on
///
/// Keeps keyless batches full. Keyed records still hash with murmur2.
#[derive(Default)]
pub struct StickyPartitioner {
    sticky: Mutex<HashMap<String, StickyState>>,
}

struct StickyState {
    partition: i32,
    batch_count: usize,
    partition_count: i32,
}

impl StickyPartitioner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Partitioner for StickyPartitioner {
    fn choose(&self, topic: &str, key: Option<&[u8]>, partition_count: i32) -> i32 {
        if let Some(key) = key {
            return murmur2_partition(key, partition_count);
        }

        let mut sticky = self.sticky.lock();
        let state = sticky
            .entry(topic.to_string())
            .or_insert_with(|| StickyState {
                partition: random_start(partition_count),
                batch_count: 0,
                partition_count,
            });

        // Partition count changed: start over
        if state.partition_count != partition_count {
            state.partition_count = partition_count;
            state.partition = random_start(partition_count);
            state.batch_count = 0;
        }

        let partition = state.partition;
        state.batch_count += 1;
        if state.batch_count >= STICKY_BATCH_THRESHOLD {
            state.partition = (state.partition + 1) % partition_count;
            state.batch_count = 0;
        }
        partition
    }
}
