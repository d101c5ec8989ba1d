// This module fine-tunes the classifier. The head is attached to the pretrained
// encoder, the training set is bucketed by length, and every epoch walks the shuffled
// buckets once: forward, sigmoid cross-entropy, backward, optional global gradient
// norm clipping, one Adam step. Running loss and throughput are logged at a fixed
// batch interval. The config, the vocabulary and the fine-tuned weights are saved to
// the artifact directory at the end.

use crate::{
    data_processing::{
        CommentBatcher, CommentDataset, CommentTrainingBatch, FixedBucketSampler, SequenceLength, TrainingSample,
    },
    error::Error,
    model::{
        logits_to_probabilities, sigmoid_binary_cross_entropy, LanguageModelEncoder, SentimentModel,
        SentimentModelConfig,
    },
    pretrained::{PretrainedLanguageModel, VOCAB_FILE},
};
use burn::{
    config::Config,
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::{AutodiffModule, Module, ModuleVisitor, ParamId},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use rand::{rngs::StdRng, SeedableRng};
use std::path::Path;
use std::time::Instant;

pub const CONFIG_FILE: &str = "config.json";
/// Weights file stem, the recorder appends `.mpk`.
pub const MODEL_FILE: &str = "model";

#[derive(Config)]
pub struct ExperimentConfig {
    pub model: SentimentModelConfig,
    pub optimizer: AdamConfig,
    #[config(default = 5e-3)]
    pub learning_rate: f64,
    /// Clip length applied to every tokenized comment.
    #[config(default = 500)]
    pub max_seq_length: usize,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 1)]
    pub num_epochs: usize,
    #[config(default = 10)]
    pub num_buckets: usize,
    #[config(default = 0.2)]
    pub bucket_ratio: f64,
    /// Maximum global L2 norm of the gradients, no clipping when absent.
    pub grad_clip: Option<f32>,
    #[config(default = 100)]
    pub log_interval: usize,
    /// Targets at or above this score are positive.
    #[config(default = 0.5)]
    pub label_threshold: f64,
    #[config(default = 0.0)]
    pub valid_ratio: f64,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = false)]
    pub freeze_pretrained: bool,
}

/// Validation loss and accuracy at a 0.5 decision threshold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
}

/// Loss accumulated between two log lines.
#[derive(Default)]
struct RunningLoss {
    loss_sum: f64,
    batches: usize,
    tokens: usize,
}

impl RunningLoss {
    fn add(&mut self, loss: f64, tokens: usize) {
        self.loss_sum += loss;
        self.batches += 1;
        self.tokens += tokens;
    }

    fn mean(&self) -> f64 {
        if self.batches == 0 {
            f64::NAN
        } else {
            self.loss_sum / self.batches as f64
        }
    }
}

pub fn train<B: AutodiffBackend>(
    device: B::Device,
    pretrained: PretrainedLanguageModel<B>,
    dataset_train: CommentDataset,
    dataset_valid: Option<CommentDataset>,
    config: &ExperimentConfig,
    artifact_dir: &Path,
) -> crate::error::Result<SentimentModel<B>> {
    if config.log_interval == 0 {
        return Err(Error::InvalidArgument("log_interval must be positive".to_string()));
    }
    std::fs::create_dir_all(artifact_dir)?;
    B::seed(config.seed);

    let PretrainedLanguageModel { vocab, encoder, .. } = pretrained;
    let pad_token = vocab
        .token_to_id(crate::data_processing::PAD_TOKEN)
        .ok_or_else(|| Error::Tokenizer("vocabulary has no padding token".to_string()))?;

    let mut model = build_model(config, encoder, &device);
    tracing::info!("Classifier ready: {} parameters", model.num_params());

    let lengths: Vec<usize> = dataset_train.iter().map(|s| s.sequence_length()).collect();
    let sampler = FixedBucketSampler::new(
        &lengths,
        config.batch_size,
        config.num_buckets,
        config.bucket_ratio,
        true,
    )?;
    tracing::info!("{sampler}");

    let batcher = CommentBatcher::<B>::new(pad_token, device.clone());
    let mut optim = config.optimizer.init::<B, SentimentModel<B>>();
    let mut rng = StdRng::seed_from_u64(config.seed);

    for epoch in 1..=config.num_epochs {
        let epoch_start = Instant::now();
        let mut epoch_loss = RunningLoss::default();
        let mut interval_loss = RunningLoss::default();
        let mut interval_start = Instant::now();

        let batches = sampler.batches(&mut rng);
        let num_batches = batches.len();

        for (batch_index, indices) in batches.into_iter().enumerate() {
            let items = gather(&dataset_train, &indices)?;
            let tokens: usize = items.iter().map(|s| s.valid_length).sum();

            let (updated, loss_value) = train_step(model, &mut optim, batcher.batch(items), config);
            model = updated;

            epoch_loss.add(loss_value, tokens);
            interval_loss.add(loss_value, tokens);

            if (batch_index + 1) % config.log_interval == 0 {
                let elapsed = interval_start.elapsed().as_secs_f64();
                tracing::info!(
                    "[Epoch {} Batch {}/{}] avg loss {:.6}, throughput {:.2}K wps",
                    epoch,
                    batch_index + 1,
                    num_batches,
                    interval_loss.mean(),
                    interval_loss.tokens as f64 / elapsed.max(f64::EPSILON) / 1000.0
                );
                interval_loss = RunningLoss::default();
                interval_start = Instant::now();
            }
        }

        let elapsed = epoch_start.elapsed().as_secs_f64();
        tracing::info!(
            "[Epoch {}] train avg loss {:.6}, throughput {:.2}K wps, time {:.2}s",
            epoch,
            epoch_loss.mean(),
            epoch_loss.tokens as f64 / elapsed.max(f64::EPSILON) / 1000.0,
            elapsed
        );

        if let Some(dataset_valid) = &dataset_valid {
            let evaluation = evaluate(&model.valid(), dataset_valid, pad_token, config, &device)?;
            tracing::info!(
                "[Epoch {}] valid loss {:.6}, valid acc {:.4}",
                epoch,
                evaluation.loss,
                evaluation.accuracy
            );
        }
    }

    config.save(artifact_dir.join(CONFIG_FILE))?;
    vocab.save(artifact_dir.join(VOCAB_FILE))?;
    save_model(&model, artifact_dir)?;
    tracing::info!("Saved config, vocabulary and weights to {}", artifact_dir.display());

    Ok(model)
}

/// Head on top of the pretrained body, with the body frozen when configured.
pub fn build_model<B: AutodiffBackend>(
    config: &ExperimentConfig,
    encoder: LanguageModelEncoder<B>,
    device: &B::Device,
) -> SentimentModel<B> {
    let model = config.model.init_with_encoder(encoder, device);
    if config.freeze_pretrained {
        model.freeze_encoder()
    } else {
        model
    }
}

/// Forward, backward, optional clipping and one optimizer step. Returns the updated
/// model and the batch loss.
pub fn train_step<B, O>(
    model: SentimentModel<B>,
    optim: &mut O,
    batch: CommentTrainingBatch<B>,
    config: &ExperimentConfig,
) -> (SentimentModel<B>, f64)
where
    B: AutodiffBackend,
    O: Optimizer<SentimentModel<B>, B>,
{
    let (loss, _) = model.forward_loss(batch);
    let loss_value = loss.clone().into_scalar().elem::<f64>();

    let mut grads = GradientsParams::from_grads(loss.backward(), &model);
    if let Some(max_norm) = config.grad_clip {
        let norm = clip_global_norm::<B, _>(&model, &mut grads, max_norm);
        tracing::debug!("Gradient norm {norm:.4}");
    }
    (optim.step(config.learning_rate, model, grads), loss_value)
}

/// Mean loss and accuracy over `dataset`, batched by length without shuffling.
pub fn evaluate<B: Backend>(
    model: &SentimentModel<B>,
    dataset: &CommentDataset,
    pad_token: u32,
    config: &ExperimentConfig,
    device: &B::Device,
) -> crate::error::Result<Evaluation> {
    let lengths: Vec<usize> = dataset.iter().map(|s| s.sequence_length()).collect();
    let sampler = FixedBucketSampler::new(
        &lengths,
        config.batch_size,
        config.num_buckets,
        config.bucket_ratio,
        false,
    )?;
    let batcher = CommentBatcher::<B>::new(pad_token, device.clone());
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut loss_sum = 0.0;
    let mut correct = 0usize;
    for indices in sampler.batches(&mut rng) {
        let items = gather(dataset, &indices)?;
        let labels: Vec<bool> = items.iter().map(|s| s.label).collect();
        let batch = batcher.batch(items);

        let logits = model.forward(batch.tokens, batch.valid_length);
        let loss = sigmoid_binary_cross_entropy(logits.clone(), batch.labels);
        loss_sum += loss.into_scalar().elem::<f64>() * labels.len() as f64;

        let probabilities = logits_to_probabilities(logits).into_data().convert::<f32>().value;
        correct += probabilities
            .iter()
            .zip(&labels)
            .filter(|(p, label)| (**p >= 0.5) == **label)
            .count();
    }

    let total = sampler.num_samples() as f64;
    Ok(Evaluation {
        loss: loss_sum / total,
        accuracy: correct as f64 / total,
    })
}

fn gather<D: Dataset<TrainingSample>>(dataset: &D, indices: &[usize]) -> crate::error::Result<Vec<TrainingSample>> {
    indices
        .iter()
        .map(|&index| {
            dataset
                .get(index)
                .ok_or_else(|| Error::InvalidArgument(format!("sample {index} out of range")))
        })
        .collect()
}

/// Saves the weights of `model` at full precision.
pub fn save_model<B: Backend>(model: &SentimentModel<B>, artifact_dir: &Path) -> crate::error::Result<()> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
        .record(model.clone().into_record(), artifact_dir.join(MODEL_FILE))
        .map_err(Error::record)
}

/// Sums the squared L2 norms of every parameter gradient.
struct GradientNorm<'a> {
    grads: &'a GradientsParams,
    squared_sum: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientNorm<'_> {
    fn visit_float<const D: usize>(&mut self, id: &ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            let squared: f64 = grad.powf_scalar(2.0).sum().into_scalar().elem();
            self.squared_sum += squared;
        }
    }
}

/// Multiplies every parameter gradient by a common factor.
struct GradientScale<'a> {
    grads: &'a mut GradientsParams,
    scale: f32,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientScale<'_> {
    fn visit_float<const D: usize>(&mut self, id: &ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads
                .register::<B::InnerBackend, D>(id.clone(), grad.mul_scalar(self.scale));
        }
    }
}

/// Rescales all gradients so their joint L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_global_norm<B, M>(model: &M, grads: &mut GradientsParams, max_norm: f32) -> f32
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut norm = GradientNorm {
        grads: &*grads,
        squared_sum: 0.0,
    };
    model.visit(&mut norm);
    let total_norm = norm.squared_sum.sqrt() as f32;

    if total_norm > max_norm {
        let mut scale = GradientScale {
            grads,
            scale: max_norm / (total_norm + 1e-6),
        };
        model.visit(&mut scale);
    }
    total_norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_processing::Vocabulary;
    use crate::model::LanguageModelConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::data::dataset::InMemDataset;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_setup() -> (PretrainedLanguageModel<TestBackend>, ExperimentConfig) {
        let vocab = Vocabulary::new(["good", "great", "bad", "awful", "movie"], false);
        let lm_config = LanguageModelConfig::new(vocab.len())
            .with_embed_size(8)
            .with_hidden_size(8)
            .with_num_layers(1)
            .with_dropout(0.0);
        let pretrained =
            PretrainedLanguageModel::from_scratch(lm_config.clone(), vocab, &Default::default()).unwrap();
        let config = ExperimentConfig::new(SentimentModelConfig::new(lm_config), AdamConfig::new())
            .with_batch_size(4)
            .with_num_buckets(2)
            .with_learning_rate(0.05)
            .with_num_epochs(15)
            .with_log_interval(2)
            .with_grad_clip(Some(5.0));
        (pretrained, config)
    }

    fn toy_dataset() -> CommentDataset {
        // good=4 great=5 bad=6 awful=7 movie=8
        let samples = vec![
            TrainingSample::new(vec![8, 4], 2, false),
            TrainingSample::new(vec![5], 1, false),
            TrainingSample::new(vec![8, 5, 4], 3, false),
            TrainingSample::new(vec![4, 4], 2, false),
            TrainingSample::new(vec![8, 6], 2, true),
            TrainingSample::new(vec![7], 1, true),
            TrainingSample::new(vec![8, 7, 6], 3, true),
            TrainingSample::new(vec![6, 6], 2, true),
        ];
        InMemDataset::new(samples)
    }

    #[test]
    fn fine_tuning_reduces_loss_and_saves_artifacts() {
        let (pretrained, config) = tiny_setup();
        let device = Default::default();
        let dataset = toy_dataset();
        let artifact_dir = tempfile::tempdir().unwrap();

        let before = config.model.init_with_encoder(pretrained.encoder.clone(), &device);
        let before = evaluate(&before.valid(), &dataset, 1, &config, &device).unwrap();

        let model = train(
            device,
            pretrained,
            toy_dataset(),
            Some(toy_dataset()),
            &config,
            artifact_dir.path(),
        )
        .unwrap();
        let after = evaluate(&model.valid(), &dataset, 1, &config, &Default::default()).unwrap();

        assert!(after.loss < before.loss, "{after:?} vs {before:?}");
        assert!(artifact_dir.path().join("config.json").exists());
        assert!(artifact_dir.path().join("vocab.json").exists());
        assert!(artifact_dir.path().join("model.mpk").exists());
    }

    #[test]
    fn global_norm_clipping_bounds_gradients() {
        let (pretrained, config) = tiny_setup();
        let device = Default::default();
        let model = config.model.init_with_encoder(pretrained.encoder, &device);
        let batcher = CommentBatcher::<TestBackend>::new(1, device);
        let batch = batcher.batch(toy_dataset().iter().collect());

        let (loss, _) = model.forward_loss(batch);
        let mut grads = GradientsParams::from_grads(loss.backward(), &model);

        let original = clip_global_norm::<TestBackend, _>(&model, &mut grads, 1.0e-3);
        assert!(original > 1.0e-3);
        let clipped = clip_global_norm::<TestBackend, _>(&model, &mut grads, f32::MAX);
        assert!((clipped - 1.0e-3).abs() < 1.0e-4, "clipped norm {clipped}");
    }

    struct ParamValues(Vec<Vec<f32>>);

    impl<B: Backend> ModuleVisitor<B> for ParamValues {
        fn visit_float<const D: usize>(&mut self, _id: &ParamId, tensor: &Tensor<B, D>) {
            self.0.push(tensor.to_data().convert::<f32>().value);
        }
    }

    fn param_values<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<f32>> {
        let mut values = ParamValues(Vec::new());
        module.visit(&mut values);
        values.0
    }

    #[test]
    fn frozen_encoder_keeps_pretrained_weights() {
        let (pretrained, config) = tiny_setup();
        let config = config.with_freeze_pretrained(true).with_num_epochs(2);
        let device = Default::default();
        let pretrained_encoder = param_values(&pretrained.encoder);

        // one step by hand: the head moves, the body does not
        let model = build_model(&config, pretrained.encoder.clone(), &device);
        let head_before = param_values(model.output());
        let mut optim = config.optimizer.init::<TestBackend, SentimentModel<TestBackend>>();
        let batch = CommentBatcher::<TestBackend>::new(1, device.clone()).batch(toy_dataset().iter().collect());
        let (model, _) = train_step(model, &mut optim, batch, &config);
        assert_eq!(param_values(model.encoder()), pretrained_encoder);
        assert_ne!(param_values(model.output()), head_before);

        // the full loop honours the flag too
        let artifact_dir = tempfile::tempdir().unwrap();
        let trained = train(device.clone(), pretrained, toy_dataset(), None, &config, artifact_dir.path()).unwrap();
        assert_eq!(param_values(trained.encoder()), pretrained_encoder);
    }

    #[test]
    fn config_survives_json() {
        let (_, config) = tiny_setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        config.save(&path).unwrap();

        let loaded = ExperimentConfig::load(&path).unwrap();
        assert_eq!(loaded.batch_size, 4);
        assert_eq!(loaded.grad_clip, Some(5.0));
        assert_eq!(loaded.model.language_model.hidden_size, 8);
    }

    #[test]
    fn zero_log_interval_is_rejected() {
        let (pretrained, config) = tiny_setup();
        let dir = tempfile::tempdir().unwrap();
        let config = config.with_log_interval(0);
        let result = train(Default::default(), pretrained, toy_dataset(), None, &config, dir.path());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
