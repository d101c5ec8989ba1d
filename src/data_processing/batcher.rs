// The batcher stacks encoded comments into padded tensors. Each batch is padded to
// its own longest sequence with the vocabulary's pad id, and carries the valid length
// of every row so the model can ignore the padding. Training batches also carry the
// binary labels as floats for the sigmoid cross-entropy loss.

use super::dataset::{InferenceSample, TrainingSample};
use burn::{
    data::dataloader::batcher::Batcher,
    nn::attention::generate_padding_mask,
    tensor::{backend::Backend, Data, Int, Shape, Tensor},
};
use derive_new::new;

#[derive(new, Clone)]
pub struct CommentBatcher<B: Backend> {
    pad_token: u32,    // id written past each row's valid length
    device: B::Device, // where batch tensors are created
}

/// Padded training batch.
#[derive(Debug, Clone, new)]
pub struct CommentTrainingBatch<B: Backend> {
    pub tokens: Tensor<B, 2, Int>,       // [batch, max_len]
    pub valid_length: Tensor<B, 1, Int>, // [batch]
    pub labels: Tensor<B, 1>,            // [batch], 0.0 or 1.0
}

/// Padded inference batch.
#[derive(Debug, Clone, new)]
pub struct CommentInferenceBatch<B: Backend> {
    pub tokens: Tensor<B, 2, Int>,       // [batch, max_len]
    pub valid_length: Tensor<B, 1, Int>, // [batch]
}

impl<B: Backend> CommentBatcher<B> {
    fn pad(&self, sequences: Vec<Vec<usize>>) -> Tensor<B, 2, Int> {
        let max_len = sequences.iter().map(Vec::len).max().unwrap_or(1);
        generate_padding_mask::<B>(self.pad_token as usize, sequences, Some(max_len), &self.device).tensor
    }

    fn lengths(&self, lengths: Vec<i64>) -> Tensor<B, 1, Int> {
        let n = lengths.len();
        let data: Data<B::IntElem, 1> = Data::new(lengths, Shape::new([n])).convert();
        Tensor::from_data(data, &self.device)
    }
}

impl<B: Backend> Batcher<TrainingSample, CommentTrainingBatch<B>> for CommentBatcher<B> {
    fn batch(&self, items: Vec<TrainingSample>) -> CommentTrainingBatch<B> {
        let mut tokens_list = Vec::with_capacity(items.len());
        let mut lengths = Vec::with_capacity(items.len());
        let mut labels = Vec::with_capacity(items.len());

        for item in items {
            lengths.push(item.valid_length as i64);
            labels.push(if item.label { 1.0f32 } else { 0.0 });
            tokens_list.push(item.token_ids.into_iter().map(|id| id as usize).collect());
        }

        let n = labels.len();
        let labels: Data<B::FloatElem, 1> = Data::new(labels, Shape::new([n])).convert();

        CommentTrainingBatch {
            tokens: self.pad(tokens_list),
            valid_length: self.lengths(lengths),
            labels: Tensor::from_data(labels, &self.device),
        }
    }
}

impl<B: Backend> Batcher<InferenceSample, CommentInferenceBatch<B>> for CommentBatcher<B> {
    fn batch(&self, items: Vec<InferenceSample>) -> CommentInferenceBatch<B> {
        let mut tokens_list = Vec::with_capacity(items.len());
        let mut lengths = Vec::with_capacity(items.len());

        for item in items {
            lengths.push(item.valid_length as i64);
            tokens_list.push(item.token_ids.into_iter().map(|id| id as usize).collect());
        }

        CommentInferenceBatch {
            tokens: self.pad(tokens_list),
            valid_length: self.lengths(lengths),
        }
    }
}
