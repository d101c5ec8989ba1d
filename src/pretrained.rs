// Loading of pretrained language models from a model zoo directory. A model is
// addressed by its name and the dataset it was trained on, e.g.
// `standard_lstm_lm_200` trained on `wikitext-2` lives in
// `<zoo>/standard_lstm_lm_200_wikitext-2/` next to its vocabulary.

use crate::data_processing::Vocabulary;
use crate::error::{Error, Result};
use crate::model::{LanguageModelConfig, LanguageModelEncoder};
use burn::{
    config::Config,
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::Backend,
};
use derive_new::new;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";
pub const VOCAB_FILE: &str = "vocab.json";
/// Weights file stem, the recorder appends `.mpk`.
pub const WEIGHTS_FILE: &str = "encoder";

/// Where to find a pretrained language model.
#[derive(new, Clone, Debug)]
pub struct PretrainedSource {
    pub zoo_dir: PathBuf,     // root holding one directory per model
    pub model_name: String,   // e.g. standard_lstm_lm_200
    pub dataset_name: String, // corpus the model was trained on, e.g. wikitext-2
}

impl PretrainedSource {
    pub fn model_dir(&self) -> PathBuf {
        self.zoo_dir
            .join(format!("{}_{}", self.model_name, self.dataset_name))
    }
}

/// Embedding table and encoder of a pretrained language model with its vocabulary.
#[derive(Debug)]
pub struct PretrainedLanguageModel<B: Backend> {
    pub config: LanguageModelConfig,
    pub vocab: Vocabulary,
    pub encoder: LanguageModelEncoder<B>,
}

impl<B: Backend> PretrainedLanguageModel<B> {
    /// Loads config, vocabulary and weights from `source`.
    pub fn load(source: &PretrainedSource, device: &B::Device) -> Result<Self> {
        let dir = source.model_dir();
        tracing::info!(
            "Loading pretrained model {} ({}) from {}",
            source.model_name,
            source.dataset_name,
            dir.display()
        );
        Self::load_dir(&dir, device)
    }

    pub fn load_dir(dir: &Path, device: &B::Device) -> Result<Self> {
        let config = LanguageModelConfig::load(dir.join(CONFIG_FILE)).map_err(Error::config)?;
        let vocab = Vocabulary::load(dir.join(VOCAB_FILE))?;
        if vocab.len() != config.vocab_size {
            return Err(Error::VocabularyMismatch {
                expected: config.vocab_size,
                actual: vocab.len(),
            });
        }

        let record = NamedMpkFileRecorder::<FullPrecisionSettings>::new()
            .load(dir.join(WEIGHTS_FILE), device)
            .map_err(Error::record)?;
        let encoder = config.init::<B>(device).load_record(record);

        tracing::info!(
            "Pretrained encoder ready: vocab={}, embed={}, hidden={}, layers={}",
            config.vocab_size,
            config.embed_size,
            config.hidden_size,
            config.num_layers
        );
        Ok(Self {
            config,
            vocab,
            encoder,
        })
    }

    /// Writes the model in the layout `load_dir` expects.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        self.config.save(dir.join(CONFIG_FILE))?;
        self.vocab.save(dir.join(VOCAB_FILE))?;
        NamedMpkFileRecorder::<FullPrecisionSettings>::new()
            .record(self.encoder.clone().into_record(), dir.join(WEIGHTS_FILE))
            .map_err(Error::record)?;
        tracing::info!("Saved language model to {}", dir.display());
        Ok(())
    }

    /// Randomly initialized model over `vocab`, sized by `config`.
    pub fn from_scratch(config: LanguageModelConfig, vocab: Vocabulary, device: &B::Device) -> Result<Self> {
        if vocab.len() != config.vocab_size {
            return Err(Error::VocabularyMismatch {
                expected: config.vocab_size,
                actual: vocab.len(),
            });
        }
        let encoder = config.init(device);
        Ok(Self {
            config,
            vocab,
            encoder,
        })
    }
}
