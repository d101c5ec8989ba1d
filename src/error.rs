//! Error types shared by the data pipeline, the model loader and the training loop.

use thiserror::Error;

/// Errors produced while loading data, building models or persisting artifacts.
#[derive(Debug, Error)]
pub enum Error {
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed CSV input or output failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Vocabulary (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A burn config file could not be read.
    #[error("Config error: {0}")]
    Config(String),

    /// Model weights could not be saved or loaded.
    #[error("Record error: {0}")]
    Record(String),

    /// Tokenizer construction or encoding failed.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// The vocabulary does not fit the embedding table.
    #[error("Vocabulary mismatch: config expects {expected} tokens, vocabulary has {actual}")]
    VocabularyMismatch {
        /// Embedding rows declared by the model config
        expected: usize,
        /// Tokens in the vocabulary file
        actual: usize,
    },

    /// A dataset with no samples was handed to the pipeline.
    #[error("Empty dataset: {0}")]
    EmptyDataset(String),

    /// A configuration knob is out of range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub(crate) fn record(err: impl std::fmt::Debug) -> Self {
        Self::Record(format!("{err:?}"))
    }

    pub(crate) fn config(err: impl std::fmt::Debug) -> Self {
        Self::Config(format!("{err:?}"))
    }

    pub(crate) fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
