// Turns raw comment text into clipped id sequences. The per-text function is pure,
// so the corpus is mapped over the rayon pool and collected back in input order.

use super::tokenizer::Tokenizer;
use crate::error::{Error, Result};
use derive_new::new;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;

/// A text after tokenization and clipping.
#[derive(new, Clone, Debug, PartialEq, Eq)]
pub struct EncodedText {
    pub token_ids: Vec<u32>,
    pub valid_length: usize,
}

#[derive(Clone)]
pub struct Preprocessor {
    tokenizer: Arc<dyn Tokenizer>,
    max_length: usize,
}

impl Preprocessor {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, max_length: usize) -> Result<Self> {
        if max_length == 0 {
            return Err(Error::InvalidArgument("max_length must be positive".to_string()));
        }
        Ok(Self { tokenizer, max_length })
    }

    /// Tokenizes `text`, keeps at most `max_length` ids and never returns an empty
    /// sequence: text without any word becomes a single unknown token.
    pub fn encode(&self, text: &str) -> Result<EncodedText> {
        let mut token_ids = self.tokenizer.encode(text)?;
        token_ids.truncate(self.max_length);
        if token_ids.is_empty() {
            token_ids.push(self.tokenizer.unk_token());
        }
        let valid_length = token_ids.len();
        Ok(EncodedText::new(token_ids, valid_length))
    }

    /// Encodes every text on all available cores. The first failure aborts the map.
    pub fn encode_corpus<S>(&self, texts: &[S]) -> Result<Vec<EncodedText>>
    where
        S: AsRef<str> + Sync,
    {
        let start = Instant::now();
        let encoded = texts
            .par_iter()
            .map(|text| self.encode(text.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(
            "Tokenized {} texts in {:.2}s on {} threads",
            encoded.len(),
            start.elapsed().as_secs_f64(),
            rayon::current_num_threads()
        );
        Ok(encoded)
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }
}
