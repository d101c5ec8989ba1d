// The Tokenizer trait is the common interface the pipeline uses to turn text into
// vocabulary ids. WordLevelTokenizer is the concrete implementation: a word-level
// model from the tokenizers library built over the pretrained vocabulary, so the
// id assignment is fixed by the language model and never changes while fine-tuning.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokenizers::models::wordlevel::WordLevel;
use tokenizers::normalizers::{Lowercase, NormalizerWrapper};
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::pre_tokenizers::PreTokenizerWrapper;

pub const UNK_TOKEN: &str = "<unk>";
pub const PAD_TOKEN: &str = "<pad>";
pub const BOS_TOKEN: &str = "<bos>";
pub const EOS_TOKEN: &str = "<eos>";

/// Reserved tokens, in the order they occupy the first ids of every vocabulary.
pub const RESERVED_TOKENS: [&str; 4] = [UNK_TOKEN, PAD_TOKEN, BOS_TOKEN, EOS_TOKEN];

/// Token <-> id mapping shipped with a pretrained language model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "VocabularyFile", into = "VocabularyFile")]
pub struct Vocabulary {
    idx_to_token: Vec<String>,
    token_to_idx: HashMap<String, u32>, // rebuilt from idx_to_token, never stored
    lowercase: bool,
}

/// On-disk layout of `vocab.json`.
#[derive(Clone, Serialize, Deserialize)]
struct VocabularyFile {
    idx_to_token: Vec<String>,
    #[serde(default)]
    lowercase: bool,
}

impl From<VocabularyFile> for Vocabulary {
    fn from(file: VocabularyFile) -> Self {
        let mut token_to_idx = HashMap::with_capacity(file.idx_to_token.len());
        for (id, token) in file.idx_to_token.iter().enumerate() {
            token_to_idx.entry(token.clone()).or_insert(id as u32);
        }
        Self {
            idx_to_token: file.idx_to_token,
            token_to_idx,
            lowercase: file.lowercase,
        }
    }
}

impl From<Vocabulary> for VocabularyFile {
    fn from(vocab: Vocabulary) -> Self {
        Self {
            idx_to_token: vocab.idx_to_token,
            lowercase: vocab.lowercase,
        }
    }
}

impl Vocabulary {
    /// Builds a vocabulary from tokens in id order. Reserved tokens are placed first
    /// and duplicates are dropped.
    pub fn new<I, S>(tokens: I, lowercase: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut idx_to_token: Vec<String> = RESERVED_TOKENS.iter().map(|t| t.to_string()).collect();
        let mut seen: HashSet<String> = idx_to_token.iter().cloned().collect();
        for token in tokens {
            let token = token.into();
            if seen.insert(token.clone()) {
                idx_to_token.push(token);
            }
        }
        VocabularyFile {
            idx_to_token,
            lowercase,
        }
        .into()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let vocab: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        for reserved in RESERVED_TOKENS {
            if vocab.token_to_id(reserved).is_none() {
                return Err(Error::Tokenizer(format!("vocabulary lacks reserved token {reserved}")));
            }
        }
        Ok(vocab)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.idx_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx_to_token.is_empty()
    }

    pub fn lowercase(&self) -> bool {
        self.lowercase
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.token_to_idx.get(token).copied()
    }

    pub fn id_to_token(&self, id: u32) -> Option<&str> {
        self.idx_to_token.get(id as usize).map(String::as_str)
    }

    fn to_map(&self) -> HashMap<String, u32> {
        self.token_to_idx.clone()
    }
}

pub trait Tokenizer: Send + Sync {
    /// Converts a text string into a sequence of vocabulary ids.
    fn encode(&self, value: &str) -> Result<Vec<u32>>;

    /// Converts a sequence of ids back into space separated tokens.
    fn decode(&self, tokens: &[u32]) -> String;

    /// Gets the size of the tokenizer's vocabulary.
    fn vocab_size(&self) -> usize;

    /// Gets the id used for padding sequences to a consistent length.
    fn pad_token(&self) -> u32;

    /// Gets the id every out-of-vocabulary word maps to.
    fn unk_token(&self) -> u32;
}

/// Word-level tokenizer over a fixed vocabulary.
pub struct WordLevelTokenizer {
    tokenizer: tokenizers::Tokenizer,
    vocab: Vocabulary,
    pad_token: u32,
    unk_token: u32,
}

impl WordLevelTokenizer {
    pub fn new(vocab: Vocabulary) -> Result<Self> {
        let unk_token = vocab
            .token_to_id(UNK_TOKEN)
            .ok_or_else(|| Error::Tokenizer(format!("missing {UNK_TOKEN}")))?;
        let pad_token = vocab
            .token_to_id(PAD_TOKEN)
            .ok_or_else(|| Error::Tokenizer(format!("missing {PAD_TOKEN}")))?;

        let model = WordLevel::builder()
            .vocab(vocab.to_map())
            .unk_token(UNK_TOKEN.to_string())
            .build()
            .map_err(Error::tokenizer)?;

        let mut tokenizer = tokenizers::Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(PreTokenizerWrapper::from(Whitespace::default()));
        if vocab.lowercase() {
            tokenizer.with_normalizer(NormalizerWrapper::from(Lowercase));
        }

        Ok(Self {
            tokenizer,
            vocab,
            pad_token,
            unk_token,
        })
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }
}

impl Tokenizer for WordLevelTokenizer {
    fn encode(&self, value: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(value, false)
            .map_err(Error::tokenizer)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32]) -> String {
        tokens
            .iter()
            .map(|id| self.vocab.id_to_token(*id).unwrap_or(UNK_TOKEN))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn pad_token(&self) -> u32 {
        self.pad_token
    }

    fn unk_token(&self) -> u32 {
        self.unk_token
    }
}

/// Splits text into words exactly the way `WordLevelTokenizer` does, without
/// mapping to ids. Used to count words when building a vocabulary.
pub fn split_words(value: &str, lowercase: bool) -> Result<Vec<String>> {
    use tokenizers::{OffsetReferential, OffsetType, PreTokenizedString, PreTokenizer};

    let value = if lowercase {
        value.to_lowercase()
    } else {
        value.to_string()
    };
    let mut pretokenized = PreTokenizedString::from(value.as_str());
    Whitespace::default()
        .pre_tokenize(&mut pretokenized)
        .map_err(Error::tokenizer)?;
    Ok(pretokenized
        .get_splits(OffsetReferential::Original, OffsetType::Byte)
        .into_iter()
        .map(|(word, _, _)| word.to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> WordLevelTokenizer {
        let vocab = Vocabulary::new(["This", "movie", "is", "amazing", "!"], false);
        WordLevelTokenizer::new(vocab).unwrap()
    }

    #[test]
    fn reserved_tokens_come_first() {
        let vocab = Vocabulary::new(["a", "<pad>", "b"], false);
        assert_eq!(vocab.token_to_id(UNK_TOKEN), Some(0));
        assert_eq!(vocab.token_to_id(PAD_TOKEN), Some(1));
        assert_eq!(vocab.token_to_id("a"), Some(4));
        assert_eq!(vocab.token_to_id("b"), Some(5));
        assert_eq!(vocab.len(), 6);
    }

    #[test]
    fn encodes_known_words() {
        let tokenizer = tokenizer();
        let ids = tokenizer.encode("This movie is amazing").unwrap();
        assert_eq!(ids, vec![4, 5, 6, 7]);
        assert_eq!(tokenizer.decode(&ids), "This movie is amazing");
    }

    #[test]
    fn unknown_words_map_to_unk() {
        let tokenizer = tokenizer();
        let ids = tokenizer.encode("This film is amazing!").unwrap();
        assert_eq!(ids, vec![4, tokenizer.unk_token(), 6, 7, 8]);
    }

    #[test]
    fn lowercase_vocabulary_normalizes_input() {
        let vocab = Vocabulary::new(["this", "movie"], true);
        let tokenizer = WordLevelTokenizer::new(vocab).unwrap();
        assert_eq!(tokenizer.encode("THIS Movie").unwrap(), vec![4, 5]);
    }

    #[test]
    fn split_words_matches_pre_tokenizer() {
        let words = split_words("Hello, World!", true).unwrap();
        assert_eq!(words, vec!["hello", ",", "world", "!"]);
    }

    #[test]
    fn vocabulary_survives_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        let vocab = Vocabulary::new(["x", "y"], true);
        vocab.save(&path).unwrap();
        assert_eq!(Vocabulary::load(&path).unwrap(), vocab);
    }

    #[test]
    fn loaded_vocabulary_answers_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        let words: Vec<String> = (0..33_000).map(|i| format!("w{i}")).collect();
        Vocabulary::new(words, false).save(&path).unwrap();

        let vocab = Vocabulary::load(&path).unwrap();
        assert_eq!(vocab.len(), 33_004);
        assert_eq!(vocab.token_to_id(PAD_TOKEN), Some(1));
        assert_eq!(vocab.token_to_id("w32999"), Some(33_003));
        assert_eq!(vocab.token_to_id("w33000"), None);
        for id in [0, 4, 17_000, 33_003] {
            let token = vocab.id_to_token(id).unwrap();
            assert_eq!(vocab.token_to_id(token), Some(id));
        }
    }

    #[test]
    fn repeated_token_in_file_keeps_first_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        std::fs::write(
            &path,
            r#"{"idx_to_token":["<unk>","<pad>","<bos>","<eos>","a","b","a"]}"#,
        )
        .unwrap();

        let vocab = Vocabulary::load(&path).unwrap();
        assert_eq!(vocab.token_to_id("a"), Some(4));
        assert!(!vocab.lowercase());
    }
}
