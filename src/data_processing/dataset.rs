// Comment datasets read from CSV. Training rows carry a continuous toxicity score
// that is binarized against a configurable threshold; test rows only carry an id
// and the text. Texts are encoded once up front so the sampler can bucket by length,
// and the encoded samples live in burn in-memory datasets.

use super::preprocess::{EncodedText, Preprocessor};
use super::tokenizer::{split_words, Vocabulary};
use crate::error::{Error, Result};
use burn::data::dataset::{Dataset, InMemDataset};
use derive_new::new;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// A labelled row of the training CSV.
#[derive(Clone, Debug, Deserialize)]
pub struct CommentRecord {
    #[serde(default)]
    pub id: String,
    pub comment_text: String,
    pub target: f64,
}

/// A row of the test CSV.
#[derive(Clone, Debug, Deserialize)]
pub struct TestRecord {
    pub id: String,
    pub comment_text: String,
}

/// Encoded comment with its binary label.
#[derive(new, Clone, Debug)]
pub struct TrainingSample {
    pub token_ids: Vec<u32>, // clipped vocabulary ids
    pub valid_length: usize, // equals token_ids.len(), at least 1
    pub label: bool,         // target at or above the threshold
}

/// Encoded comment waiting for a prediction.
#[derive(new, Clone, Debug)]
pub struct InferenceSample {
    pub id: String,          // copied to the submission row
    pub token_ids: Vec<u32>, // clipped vocabulary ids
    pub valid_length: usize, // equals token_ids.len(), at least 1
}

/// Length statistic used for bucketing.
pub trait SequenceLength {
    fn sequence_length(&self) -> usize;
}

impl SequenceLength for TrainingSample {
    fn sequence_length(&self) -> usize {
        self.valid_length
    }
}

impl SequenceLength for InferenceSample {
    fn sequence_length(&self) -> usize {
        self.valid_length
    }
}

pub type CommentDataset = InMemDataset<TrainingSample>;
pub type TestDataset = InMemDataset<InferenceSample>;

pub fn read_comments(path: impl AsRef<Path>) -> Result<Vec<CommentRecord>> {
    read_csv(path)
}

pub fn read_test_comments(path: impl AsRef<Path>) -> Result<Vec<TestRecord>> {
    read_csv(path)
}

fn read_csv<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let records = reader
        .deserialize()
        .collect::<std::result::Result<Vec<T>, csv::Error>>()?;
    tracing::info!("Read {} rows from {}", records.len(), path.display());
    Ok(records)
}

/// Binarizes a continuous score. Scores at the threshold count as positive.
pub fn binarize(target: f64, threshold: f64) -> bool {
    target >= threshold
}

/// Encodes labelled comments into a training dataset.
pub fn encode_comments(
    records: &[CommentRecord],
    preprocessor: &Preprocessor,
    threshold: f64,
) -> Result<CommentDataset> {
    if records.is_empty() {
        return Err(Error::EmptyDataset("training CSV has no rows".to_string()));
    }
    let texts: Vec<&str> = records.iter().map(|r| r.comment_text.as_str()).collect();
    let encoded = preprocessor.encode_corpus(&texts)?;

    let samples: Vec<TrainingSample> = records
        .iter()
        .zip(encoded)
        .map(|(record, EncodedText { token_ids, valid_length })| {
            TrainingSample::new(token_ids, valid_length, binarize(record.target, threshold))
        })
        .collect();

    let positives = samples.iter().filter(|s| s.label).count();
    tracing::info!(
        "Encoded {} training samples, {} positive at threshold {}",
        samples.len(),
        positives,
        threshold
    );
    Ok(InMemDataset::new(samples))
}

/// Encodes unlabelled comments, keeping their ids and input order.
pub fn encode_test_comments(records: &[TestRecord], preprocessor: &Preprocessor) -> Result<TestDataset> {
    if records.is_empty() {
        return Err(Error::EmptyDataset("test CSV has no rows".to_string()));
    }
    let texts: Vec<&str> = records.iter().map(|r| r.comment_text.as_str()).collect();
    let encoded = preprocessor.encode_corpus(&texts)?;

    let samples = records
        .iter()
        .zip(encoded)
        .map(|(record, encoded)| {
            InferenceSample::new(record.id.clone(), encoded.token_ids, encoded.valid_length)
        })
        .collect();
    Ok(InMemDataset::new(samples))
}

/// Holds out a shuffled `valid_ratio` fraction of the samples. A ratio of zero keeps
/// everything for training and returns no validation set.
pub fn train_valid_split<D>(
    dataset: &D,
    valid_ratio: f64,
    seed: u64,
) -> Result<(CommentDataset, Option<CommentDataset>)>
where
    D: Dataset<TrainingSample>,
{
    if !(0.0..1.0).contains(&valid_ratio) {
        return Err(Error::InvalidArgument(format!(
            "valid_ratio must be in [0, 1), got {valid_ratio}"
        )));
    }
    let mut samples: Vec<TrainingSample> = dataset.iter().collect();
    if valid_ratio == 0.0 {
        return Ok((InMemDataset::new(samples), None));
    }

    samples.shuffle(&mut StdRng::seed_from_u64(seed));
    let num_valid = ((samples.len() as f64) * valid_ratio).round() as usize;
    if num_valid == 0 || num_valid == samples.len() {
        return Ok((InMemDataset::new(samples), None));
    }
    let train = samples.split_off(num_valid);
    tracing::info!("Split {} train / {} valid samples", train.len(), samples.len());
    Ok((InMemDataset::new(train), Some(InMemDataset::new(samples))))
}

/// Counts words in `texts` and keeps the `max_size` most frequent ones seen at
/// least `min_freq` times. Ties are broken alphabetically.
pub fn build_vocabulary<S: AsRef<str>>(
    texts: &[S],
    min_freq: usize,
    max_size: usize,
    lowercase: bool,
) -> Result<Vocabulary> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for text in texts {
        for word in split_words(text.as_ref(), lowercase)? {
            *counts.entry(word).or_insert(0) += 1;
        }
    }

    let mut counts: Vec<(String, usize)> = counts
        .into_iter()
        .filter(|(_, count)| *count >= min_freq)
        .collect();
    counts.sort_by(|(a, ca), (b, cb)| cb.cmp(ca).then_with(|| a.cmp(b)));
    counts.truncate(max_size);

    Ok(Vocabulary::new(counts.into_iter().map(|(word, _)| word), lowercase))
}
