// Text classifier built on a pretrained recurrent language model. The embedding table
// and the LSTM stack come from the language model; the classification head on top
// averages the encoder outputs over the valid timesteps of every comment and projects
// the pooled vector to a single logit.

use crate::data_processing::{CommentInferenceBatch, CommentTrainingBatch};
use burn::{
    config::Config,
    module::Module,
    nn::{
        lstm::{Lstm, LstmConfig},
        Dropout, DropoutConfig, Embedding, EmbeddingConfig, Linear, LinearConfig,
    },
    tensor::{backend::Backend, Int, Tensor},
};

/// Architecture of the pretrained language model body.
#[derive(Config, Debug)]
pub struct LanguageModelConfig {
    pub vocab_size: usize,
    #[config(default = 200)]
    pub embed_size: usize,
    #[config(default = 200)]
    pub hidden_size: usize,
    #[config(default = 2)]
    pub num_layers: usize,
    /// Dropout on the embeddings and between LSTM layers.
    #[config(default = 0.2)]
    pub dropout: f64,
}

impl LanguageModelConfig {
    /// Fresh, randomly initialized body.
    pub fn init<B: Backend>(&self, device: &B::Device) -> LanguageModelEncoder<B> {
        let embedding = EmbeddingConfig::new(self.vocab_size, self.embed_size).init(device);
        let layers = (0..self.num_layers)
            .map(|layer| {
                let d_input = if layer == 0 {
                    self.embed_size
                } else {
                    self.hidden_size
                };
                LstmConfig::new(d_input, self.hidden_size, true).init(device)
            })
            .collect();

        LanguageModelEncoder {
            embedding,
            layers,
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

/// Embedding table followed by stacked unidirectional LSTM layers.
#[derive(Module, Debug)]
pub struct LanguageModelEncoder<B: Backend> {
    embedding: Embedding<B>, // word vectors of the pretrained vocabulary
    layers: Vec<Lstm<B>>,    // bottom to top
    dropout: Dropout,        // shared by the embedding and every inner layer output
}

impl<B: Backend> LanguageModelEncoder<B> {
    /// `[batch, seq]` token ids to `[batch, seq, hidden]` top-layer hidden states.
    pub fn forward(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let mut x = self.dropout.forward(self.embedding.forward(tokens));
        let num_layers = self.layers.len();

        for (index, layer) in self.layers.iter().enumerate() {
            let (_cell_states, hidden_states) = layer.forward(x, None);
            x = if index + 1 < num_layers {
                self.dropout.forward(hidden_states)
            } else {
                hidden_states
            };
        }
        x
    }
}

/// Averages `features` over the first `valid_length` timesteps of every row.
///
/// Positions at or beyond a row's valid length are zeroed before summing, so finite
/// padding values never reach the output. Lengths are clamped to at least one.
pub fn mean_pool<B: Backend>(features: Tensor<B, 3>, valid_length: Tensor<B, 1, Int>) -> Tensor<B, 2> {
    let [batch_size, seq_length, hidden_size] = features.dims();
    let device = features.device();
    let valid_length = valid_length.clamp_min(1);

    let positions = Tensor::<B, 1, Int>::arange(0..seq_length, &device)
        .reshape([1, seq_length, 1])
        .repeat(0, batch_size)
        .repeat(2, hidden_size);
    let lengths = valid_length
        .clone()
        .reshape([batch_size, 1, 1])
        .repeat(1, seq_length)
        .repeat(2, hidden_size);
    let padding = positions.greater_equal(lengths);

    let summed = features
        .mask_fill(padding, 0.0)
        .sum_dim(1)
        .reshape([batch_size, hidden_size]);
    let counts = valid_length
        .float()
        .reshape([batch_size, 1])
        .repeat(1, hidden_size);

    summed / counts
}

/// `1 / (1 + exp(-x))`, mapping a logit of zero to exactly one half.
pub fn logits_to_probabilities<B: Backend, const D: usize>(logits: Tensor<B, D>) -> Tensor<B, D> {
    logits.neg().exp().add_scalar(1.0).recip()
}

/// Mean sigmoid binary cross-entropy computed from logits:
/// `max(x, 0) - x * y + log(1 + exp(-|x|))`.
pub fn sigmoid_binary_cross_entropy<B: Backend>(logits: Tensor<B, 1>, labels: Tensor<B, 1>) -> Tensor<B, 1> {
    let positive_part = logits.clone().clamp_min(0.0);
    let magnitude = positive_part.clone() + logits.clone().neg().clamp_min(0.0);
    let log_term = magnitude.neg().exp().add_scalar(1.0).log();

    (positive_part - logits * labels + log_term).mean()
}

#[derive(Config)]
pub struct SentimentModelConfig {
    pub language_model: LanguageModelConfig,
    /// Dropout applied to the pooled vector before the output layer.
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl SentimentModelConfig {
    /// Model with a random body, used when restoring a fine-tuned snapshot.
    pub fn init<B: Backend>(&self, device: &B::Device) -> SentimentModel<B> {
        self.init_with_encoder(self.language_model.init(device), device)
    }

    /// Attaches a freshly initialized head to a pretrained body.
    pub fn init_with_encoder<B: Backend>(
        &self,
        encoder: LanguageModelEncoder<B>,
        device: &B::Device,
    ) -> SentimentModel<B> {
        SentimentModel {
            encoder,
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.language_model.hidden_size, 1).init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct SentimentModel<B: Backend> {
    encoder: LanguageModelEncoder<B>, // pretrained body
    dropout: Dropout,                 // before the projection
    output: Linear<B>,                // hidden -> one logit
}

impl<B: Backend> SentimentModel<B> {
    /// One logit per row.
    pub fn forward(&self, tokens: Tensor<B, 2, Int>, valid_length: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let [batch_size, _] = tokens.dims();

        let encoded = self.encoder.forward(tokens);
        let pooled = mean_pool(encoded, valid_length);
        let logits = self.output.forward(self.dropout.forward(pooled));

        logits.reshape([batch_size])
    }

    /// Returns the batch loss and the logits it was computed from.
    pub fn forward_loss(&self, batch: CommentTrainingBatch<B>) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let logits = self.forward(batch.tokens, batch.valid_length);
        let loss = sigmoid_binary_cross_entropy(logits.clone(), batch.labels);
        (loss, logits)
    }

    /// Probability of the positive class for every row.
    pub fn inference(&self, batch: CommentInferenceBatch<B>) -> Tensor<B, 1> {
        logits_to_probabilities(self.forward(batch.tokens, batch.valid_length))
    }

    pub fn encoder(&self) -> &LanguageModelEncoder<B> {
        &self.encoder
    }

    pub fn output(&self) -> &Linear<B> {
        &self.output
    }

    /// Stops gradient tracking on the pretrained body so only the head trains.
    pub fn freeze_encoder(self) -> Self {
        Self {
            encoder: self.encoder.no_grad(),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Data, Shape};

    type TestBackend = NdArray<f32>;

    fn features(values: Vec<f32>, shape: [usize; 3]) -> Tensor<TestBackend, 3> {
        Tensor::from_data(Data::new(values, Shape::new(shape)), &Default::default())
    }

    fn lengths(values: Vec<i64>) -> Tensor<TestBackend, 1, Int> {
        let n = values.len();
        Tensor::from_data(Data::new(values, Shape::new([n])), &Default::default())
    }

    fn logits(values: Vec<f32>) -> Tensor<TestBackend, 1> {
        let n = values.len();
        Tensor::from_data(Data::new(values, Shape::new([n])), &Default::default())
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-5, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn mean_pool_averages_valid_prefix() {
        // row 0: valid length 2, row 1: valid length 3
        let values = vec![
            1.0, 2.0, //
            3.0, 4.0, //
            9.0, 9.0, //
            5.0, 1.0, //
            7.0, 3.0, //
            0.0, 2.0, //
        ];
        let pooled = mean_pool(features(values, [2, 3, 2]), lengths(vec![2, 3]));
        assert_eq!(pooled.dims(), [2, 2]);
        assert_close(&pooled.into_data().value, &[2.0, 3.0, 4.0, 2.0]);
    }

    #[test]
    fn mean_pool_ignores_padding_content() {
        let prefix = [0.5, -1.0, 2.0, 0.25];
        let with_pad = |pad: f32| {
            let mut values = prefix.to_vec();
            values.extend([pad; 4]);
            mean_pool(features(values, [1, 4, 2]), lengths(vec![2])).into_data().value
        };

        let reference = with_pad(0.0);
        assert_eq!(with_pad(1.0e6), reference);
        assert_eq!(with_pad(-3.5), reference);
        assert_close(&reference, &[1.25, -0.375]);
    }

    #[test]
    fn mean_pool_never_divides_by_zero() {
        let pooled = mean_pool(features(vec![4.0, 6.0], [1, 1, 2]), lengths(vec![0]));
        let values = pooled.into_data().value;
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn zero_logit_is_one_half() {
        let probabilities = logits_to_probabilities(logits(vec![0.0, 3.0, -3.0, 200.0, -200.0]))
            .into_data()
            .value;
        assert_eq!(probabilities[0], 0.5);
        assert!(probabilities.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!(probabilities[1] > 0.5 && probabilities[2] < 0.5);
        assert_close(&[probabilities[1] + probabilities[2]], &[1.0]);
    }

    #[test]
    fn cross_entropy_matches_closed_form() {
        let loss = sigmoid_binary_cross_entropy(logits(vec![0.0, 0.0]), logits(vec![1.0, 0.0]));
        assert_close(&loss.into_data().value, &[std::f32::consts::LN_2]);

        let confident = sigmoid_binary_cross_entropy(logits(vec![50.0, -50.0]), logits(vec![1.0, 0.0]));
        let value = confident.into_scalar();
        assert!(value >= 0.0 && value < 1e-6);

        let wrong = sigmoid_binary_cross_entropy(logits(vec![-50.0]), logits(vec![1.0]));
        assert_close(&[wrong.into_scalar()], &[50.0]);
    }

    #[test]
    fn classifier_output_does_not_depend_on_padding() {
        let device = Default::default();
        let config = SentimentModelConfig::new(
            LanguageModelConfig::new(20)
                .with_embed_size(8)
                .with_hidden_size(6)
                .with_num_layers(2),
        );
        let model: SentimentModel<TestBackend> = config.init(&device);

        let tokens = |values: Vec<i64>, shape: [usize; 2]| {
            Tensor::<TestBackend, 2, Int>::from_data(Data::new(values, Shape::new(shape)), &device)
        };

        let alone = CommentInferenceBatch::new(tokens(vec![4, 9, 11], [1, 3]), lengths(vec![3]));
        let padded = CommentInferenceBatch::new(
            tokens(vec![4, 9, 11, 1, 1, 5, 6, 7, 8, 12], [2, 5]),
            lengths(vec![3, 5]),
        );
        let garbage_pad = CommentInferenceBatch::new(
            tokens(vec![4, 9, 11, 17, 3, 5, 6, 7, 8, 12], [2, 5]),
            lengths(vec![3, 5]),
        );

        let alone = model.inference(alone).into_data().value;
        let padded = model.inference(padded).into_data().value;
        let garbage_pad = model.inference(garbage_pad).into_data().value;

        assert_close(&alone, &padded[..1]);
        assert_close(&padded, &garbage_pad);
        assert!(padded.iter().all(|p| (0.0..=1.0).contains(p)));
    }
}
