// This module runs a fine-tuned classifier over unlabeled comments. The model, its
// config and the vocabulary are restored from the training artifact directory; the
// test set is batched by length like the training set, and the probabilities are put
// back in input order before they are written out as `id,prediction` rows.

use crate::{
    data_processing::{
        CommentBatcher, FixedBucketSampler, InferenceSample, SequenceLength, TestDataset, Vocabulary,
        WordLevelTokenizer, PAD_TOKEN,
    },
    error::{Error, Result},
    model::SentimentModel,
    pretrained::VOCAB_FILE,
    training::{ExperimentConfig, CONFIG_FILE, MODEL_FILE},
};
use burn::{
    config::Config,
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::Backend,
};
use derive_new::new;
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use std::path::Path;

/// One output row.
#[derive(new, Clone, Debug, PartialEq, Serialize)]
pub struct Prediction {
    pub id: String,
    pub prediction: f32,
}

/// Everything needed to score new comments.
pub struct TrainedClassifier<B: Backend> {
    pub config: ExperimentConfig,
    pub vocab: Vocabulary,
    pub model: SentimentModel<B>,
}

impl<B: Backend> TrainedClassifier<B> {
    /// Restores config, vocabulary and weights written by `training::train`.
    pub fn load(artifact_dir: &Path, device: &B::Device) -> Result<Self> {
        let config = ExperimentConfig::load(artifact_dir.join(CONFIG_FILE)).map_err(Error::config)?;
        let vocab = Vocabulary::load(artifact_dir.join(VOCAB_FILE))?;
        let model = load_model(&config, artifact_dir, device)?;
        tracing::info!("Loaded classifier from {}", artifact_dir.display());

        Ok(Self { config, vocab, model })
    }

    pub fn tokenizer(&self) -> Result<WordLevelTokenizer> {
        WordLevelTokenizer::new(self.vocab.clone())
    }

    pub fn predict(&self, dataset: &TestDataset, batch_size: usize, device: &B::Device) -> Result<Vec<Prediction>> {
        let pad_token = self
            .vocab
            .token_to_id(PAD_TOKEN)
            .ok_or_else(|| Error::Tokenizer("vocabulary has no padding token".to_string()))?;
        predict(
            &self.model,
            dataset,
            pad_token,
            batch_size,
            self.config.num_buckets,
            self.config.bucket_ratio,
            device,
        )
    }
}

/// Rebuilds the classifier described by `config` and loads its weights.
pub fn load_model<B: Backend>(
    config: &ExperimentConfig,
    artifact_dir: &Path,
    device: &B::Device,
) -> Result<SentimentModel<B>> {
    let record = NamedMpkFileRecorder::<FullPrecisionSettings>::new()
        .load(artifact_dir.join(MODEL_FILE), device)
        .map_err(Error::record)?;
    Ok(config.model.init::<B>(device).load_record(record))
}

/// Scores every sample of `dataset`. Batches are formed by length without shuffling
/// and the results come back in dataset order.
pub fn predict<B: Backend>(
    model: &SentimentModel<B>,
    dataset: &TestDataset,
    pad_token: u32,
    batch_size: usize,
    num_buckets: usize,
    bucket_ratio: f64,
    device: &B::Device,
) -> Result<Vec<Prediction>> {
    let lengths: Vec<usize> = dataset.iter().map(|s| s.sequence_length()).collect();
    let sampler = FixedBucketSampler::new(&lengths, batch_size, num_buckets, bucket_ratio, false)?;
    let batcher = CommentBatcher::<B>::new(pad_token, device.clone());
    tracing::info!("Running inference over {} comments in {} batches", dataset.len(), sampler.num_batches());

    let mut probabilities: Vec<Option<f32>> = vec![None; dataset.len()];
    let mut rng = StdRng::seed_from_u64(0);
    for indices in sampler.batches(&mut rng) {
        let items = indices
            .iter()
            .map(|&index| {
                dataset
                    .get(index)
                    .ok_or_else(|| Error::InvalidArgument(format!("sample {index} out of range")))
            })
            .collect::<Result<Vec<InferenceSample>>>()?;

        let output = model.inference(batcher.batch(items));
        let values = output.into_data().convert::<f32>().value;
        for (index, value) in indices.into_iter().zip(values) {
            probabilities[index] = Some(value);
        }
    }

    dataset
        .iter()
        .zip(probabilities)
        .map(|(sample, probability)| match probability {
            Some(p) => Ok(Prediction::new(sample.id, p)),
            None => Err(Error::InvalidArgument(format!("no prediction for {}", sample.id))),
        })
        .collect()
}

/// Writes `id,prediction` rows in the given order.
pub fn write_submission(path: &Path, predictions: &[Prediction]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for prediction in predictions {
        writer.serialize(prediction)?;
    }
    writer.flush()?;
    tracing::info!("Wrote {} predictions to {}", predictions.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LanguageModelConfig, SentimentModelConfig};
    use crate::training::save_model;
    use burn::backend::NdArray;
    use burn::data::dataset::InMemDataset;
    use burn::optim::AdamConfig;

    type TestBackend = NdArray<f32>;

    fn config() -> ExperimentConfig {
        let lm = LanguageModelConfig::new(12).with_embed_size(6).with_hidden_size(5);
        ExperimentConfig::new(SentimentModelConfig::new(lm), AdamConfig::new())
            .with_batch_size(2)
            .with_num_buckets(3)
    }

    fn test_dataset() -> TestDataset {
        InMemDataset::new(vec![
            InferenceSample::new("long".to_string(), vec![4, 5, 6, 7, 8, 9], 6),
            InferenceSample::new("short".to_string(), vec![4], 1),
            InferenceSample::new("mid".to_string(), vec![10, 11, 4], 3),
            InferenceSample::new("short2".to_string(), vec![9], 1),
            InferenceSample::new("long2".to_string(), vec![9, 8, 7, 6, 5], 5),
        ])
    }

    #[test]
    fn predictions_follow_input_order() {
        let device = Default::default();
        let config = config();
        let model: SentimentModel<TestBackend> = config.model.init(&device);
        let dataset = test_dataset();

        let predictions = predict(&model, &dataset, 1, 2, 3, 0.2, &device).unwrap();
        let ids: Vec<&str> = predictions.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["long", "short", "mid", "short2", "long2"]);
        assert!(predictions.iter().all(|p| (0.0..=1.0).contains(&p.prediction)));

        // same comment scored alone gives the same probability
        let single = InMemDataset::new(vec![InferenceSample::new("mid".to_string(), vec![10, 11, 4], 3)]);
        let alone = predict(&model, &single, 1, 2, 3, 0.2, &device).unwrap();
        assert!((alone[0].prediction - predictions[2].prediction).abs() < 1e-5);
    }

    #[test]
    fn reloaded_snapshot_predicts_identically() {
        let device = Default::default();
        let config = config();
        let dir = tempfile::tempdir().unwrap();
        let model: SentimentModel<TestBackend> = config.model.init(&device);
        save_model(&model, dir.path()).unwrap();

        let reloaded = load_model::<TestBackend>(&config, dir.path(), &device).unwrap();
        let dataset = test_dataset();
        let expected = predict(&model, &dataset, 1, 2, 3, 0.2, &device).unwrap();
        let actual = predict(&reloaded, &dataset, 1, 2, 3, 0.2, &device).unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn submission_has_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("submission.csv");
        write_submission(
            &path,
            &[Prediction::new("7".to_string(), 0.25), Prediction::new("3".to_string(), 1.0)],
        )
        .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "id,prediction\n7,0.25\n3,1.0\n");
    }
}
