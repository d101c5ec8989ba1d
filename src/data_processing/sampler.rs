// Length-bucketed batching. Samples are assigned to constant-width length buckets,
// shorter buckets get proportionally larger batches, and each epoch draws every
// sample exactly once.

use crate::error::{Error, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::fmt;

#[derive(Clone, Debug)]
struct Bucket {
    key: usize,
    batch_size: usize,
    indices: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct FixedBucketSampler {
    buckets: Vec<Bucket>,
    num_samples: usize,
    shuffle: bool,
}

impl FixedBucketSampler {
    /// Buckets sample indices by `lengths`.
    ///
    /// `ratio` scales the batch size of shorter buckets: a bucket with key `k` gets
    /// `max(floor(max_key / k * ratio * batch_size), batch_size)` samples per batch.
    /// A ratio of zero uses `batch_size` everywhere.
    pub fn new(
        lengths: &[usize],
        batch_size: usize,
        num_buckets: usize,
        ratio: f64,
        shuffle: bool,
    ) -> Result<Self> {
        if lengths.is_empty() {
            return Err(Error::EmptyDataset("nothing to sample".to_string()));
        }
        if batch_size == 0 || num_buckets == 0 {
            return Err(Error::InvalidArgument(format!(
                "batch_size ({batch_size}) and num_buckets ({num_buckets}) must be positive"
            )));
        }
        if ratio < 0.0 {
            return Err(Error::InvalidArgument(format!("bucket ratio must be >= 0, got {ratio}")));
        }

        let keys = bucket_keys(lengths, num_buckets);
        let max_key = keys.last().copied().unwrap_or(1).max(1);

        let mut buckets: Vec<Bucket> = keys
            .iter()
            .map(|&key| {
                let batch_size = if ratio > 0.0 {
                    let scaled = (max_key as f64 / key.max(1) as f64 * ratio * batch_size as f64) as usize;
                    scaled.max(batch_size)
                } else {
                    batch_size
                };
                Bucket {
                    key,
                    batch_size,
                    indices: Vec::new(),
                }
            })
            .collect();

        for (index, &length) in lengths.iter().enumerate() {
            // keys are sorted and the last one is the maximum length
            let slot = keys.partition_point(|&key| key < length);
            buckets[slot].indices.push(index);
        }
        buckets.retain(|bucket| !bucket.indices.is_empty());

        Ok(Self {
            buckets,
            num_samples: lengths.len(),
            shuffle,
        })
    }

    /// Index batches for one epoch.
    pub fn batches<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<Vec<usize>> {
        let mut batches = Vec::with_capacity(self.num_batches());
        for bucket in &self.buckets {
            let mut indices = bucket.indices.clone();
            if self.shuffle {
                indices.shuffle(rng);
            }
            batches.extend(indices.chunks(bucket.batch_size).map(<[usize]>::to_vec));
        }
        if self.shuffle {
            batches.shuffle(rng);
        }
        batches
    }

    pub fn num_batches(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.indices.len().div_ceil(bucket.batch_size))
            .sum()
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn bucket_keys(&self) -> Vec<usize> {
        self.buckets.iter().map(|bucket| bucket.key).collect()
    }

    pub fn bucket_batch_sizes(&self) -> Vec<usize> {
        self.buckets.iter().map(|bucket| bucket.batch_size).collect()
    }

    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.iter().map(|bucket| bucket.indices.len()).collect()
    }
}

impl fmt::Display for FixedBucketSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FixedBucketSampler: samples={}, batches={}, keys={:?}, batch_sizes={:?}, sizes={:?}",
            self.num_samples,
            self.num_batches(),
            self.bucket_keys(),
            self.bucket_batch_sizes(),
            self.bucket_sizes()
        )
    }
}

/// Constant-width bucket keys between the shortest and the longest length,
/// deduplicated and ascending.
fn bucket_keys(lengths: &[usize], num_buckets: usize) -> Vec<usize> {
    let max_length = lengths.iter().copied().max().unwrap_or(0);
    let min_length = lengths.iter().copied().min().unwrap_or(0);
    let width = ((1 + max_length - min_length) / num_buckets).max(1);

    let mut keys: Vec<usize> = (0..num_buckets)
        .map(|i| max_length.saturating_sub(i * width).max(min_length))
        .collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}
