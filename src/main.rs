use anyhow::{Context, Result};
use burn::optim::AdamConfig;
use burn::tensor::backend::{AutodiffBackend, Backend};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use toxic_lstm::data_processing::{
    build_vocabulary, encode_comments, encode_test_comments, read_comments, read_test_comments,
    train_valid_split, Preprocessor, WordLevelTokenizer,
};
use toxic_lstm::inference::{write_submission, TrainedClassifier};
use toxic_lstm::model::{LanguageModelConfig, SentimentModelConfig};
use toxic_lstm::pretrained::{PretrainedLanguageModel, PretrainedSource};
use toxic_lstm::training::{self, ExperimentConfig};

/// Fine-tune a pretrained LSTM language model into a toxicity classifier.
#[derive(Parser, Debug)]
#[command(name = "toxic_lstm", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fine-tune the classifier on a labelled CSV
    Train(TrainArgs),

    /// Score a test CSV and write a submission file
    Predict(PredictArgs),

    /// Write a randomly initialized language model built from a corpus vocabulary
    InitPretrained(InitPretrainedArgs),
}

/// Location of a language model inside the zoo directory.
#[derive(Args, Debug)]
struct ZooArgs {
    #[arg(long, default_value = "models")]
    model_zoo: PathBuf,

    #[arg(long, default_value = "standard_lstm_lm_200")]
    model_name: String,

    /// Dataset the language model was trained on
    #[arg(long, default_value = "wikitext-2")]
    dataset_name: String,
}

impl ZooArgs {
    fn source(&self) -> PretrainedSource {
        PretrainedSource::new(self.model_zoo.clone(), self.model_name.clone(), self.dataset_name.clone())
    }
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// CSV with `comment_text` and a continuous `target` column
    #[arg(long)]
    train_csv: PathBuf,

    #[command(flatten)]
    zoo: ZooArgs,

    /// Where the config, vocabulary and fine-tuned weights are written
    #[arg(long, default_value = "artifacts")]
    artifact_dir: PathBuf,

    /// Dropout before the output layer
    #[arg(long, default_value_t = 0.0)]
    dropout: f64,

    #[arg(long, default_value_t = 5e-3)]
    lr: f64,

    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    #[arg(long, default_value_t = 1)]
    epochs: usize,

    #[arg(long, default_value_t = 10)]
    num_buckets: usize,

    /// Batch size scaling for shorter buckets, 0 disables it
    #[arg(long, default_value_t = 0.2)]
    bucket_ratio: f64,

    /// Maximum global gradient norm
    #[arg(long)]
    grad_clip: Option<f32>,

    /// Batches between two progress lines
    #[arg(long, default_value_t = 100)]
    log_interval: usize,

    /// Tokens kept per comment
    #[arg(long, default_value_t = 500)]
    max_length: usize,

    /// Targets at or above this value are labelled toxic
    #[arg(long, default_value_t = 0.5)]
    label_threshold: f64,

    /// Fraction of the training rows held out for validation
    #[arg(long, default_value_t = 0.0)]
    valid_ratio: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Train the head only
    #[arg(long)]
    freeze_pretrained: bool,
}

#[derive(Args, Debug)]
struct PredictArgs {
    /// CSV with `id` and `comment_text` columns
    #[arg(long)]
    test_csv: PathBuf,

    #[arg(long, default_value = "artifacts")]
    artifact_dir: PathBuf,

    #[arg(long, default_value = "submission.csv")]
    output: PathBuf,

    /// Defaults to the training batch size
    #[arg(long)]
    batch_size: Option<usize>,
}

#[derive(Args, Debug)]
struct InitPretrainedArgs {
    /// Corpus the vocabulary is counted on
    #[arg(long)]
    train_csv: PathBuf,

    #[command(flatten)]
    zoo: ZooArgs,

    #[arg(long, default_value_t = 200)]
    embed_size: usize,

    #[arg(long, default_value_t = 200)]
    hidden_size: usize,

    #[arg(long, default_value_t = 2)]
    num_layers: usize,

    #[arg(long, default_value_t = 2)]
    min_freq: usize,

    #[arg(long, default_value_t = 50_000)]
    max_vocab: usize,

    #[arg(long)]
    lowercase: bool,
}

fn run_train<B: AutodiffBackend>(args: TrainArgs, device: B::Device) -> Result<()> {
    let pretrained = PretrainedLanguageModel::<B>::load(&args.zoo.source(), &device)
        .context("cannot load the pretrained language model")?;

    let tokenizer = Arc::new(WordLevelTokenizer::new(pretrained.vocab.clone())?);
    let preprocessor = Preprocessor::new(tokenizer, args.max_length)?;
    let records = read_comments(&args.train_csv)
        .with_context(|| format!("cannot read {}", args.train_csv.display()))?;
    let dataset = encode_comments(&records, &preprocessor, args.label_threshold)?;
    let (dataset_train, dataset_valid) = train_valid_split(&dataset, args.valid_ratio, args.seed)?;

    let config = ExperimentConfig::new(
        SentimentModelConfig::new(pretrained.config.clone()).with_dropout(args.dropout),
        AdamConfig::new(),
    )
    .with_learning_rate(args.lr)
    .with_max_seq_length(args.max_length)
    .with_batch_size(args.batch_size)
    .with_num_epochs(args.epochs)
    .with_num_buckets(args.num_buckets)
    .with_bucket_ratio(args.bucket_ratio)
    .with_grad_clip(args.grad_clip)
    .with_log_interval(args.log_interval)
    .with_label_threshold(args.label_threshold)
    .with_valid_ratio(args.valid_ratio)
    .with_seed(args.seed)
    .with_freeze_pretrained(args.freeze_pretrained);

    training::train::<B>(device, pretrained, dataset_train, dataset_valid, &config, &args.artifact_dir)?;
    Ok(())
}

fn run_predict<B: Backend>(args: PredictArgs, device: B::Device) -> Result<()> {
    let classifier = TrainedClassifier::<B>::load(&args.artifact_dir, &device)
        .with_context(|| format!("cannot load a trained model from {}", args.artifact_dir.display()))?;

    let tokenizer = Arc::new(classifier.tokenizer()?);
    let preprocessor = Preprocessor::new(tokenizer, classifier.config.max_seq_length)?;
    let records = read_test_comments(&args.test_csv)
        .with_context(|| format!("cannot read {}", args.test_csv.display()))?;
    let dataset = encode_test_comments(&records, &preprocessor)?;

    let batch_size = args.batch_size.unwrap_or(classifier.config.batch_size);
    let predictions = classifier.predict(&dataset, batch_size, &device)?;
    write_submission(&args.output, &predictions)?;
    Ok(())
}

fn run_init_pretrained<B: Backend>(args: InitPretrainedArgs, device: B::Device) -> Result<()> {
    let records = read_comments(&args.train_csv)
        .with_context(|| format!("cannot read {}", args.train_csv.display()))?;
    let texts: Vec<&str> = records.iter().map(|r| r.comment_text.as_str()).collect();
    let vocab = build_vocabulary(&texts, args.min_freq, args.max_vocab, args.lowercase)?;
    tracing::info!("Vocabulary of {} tokens", vocab.len());

    let config = LanguageModelConfig::new(vocab.len())
        .with_embed_size(args.embed_size)
        .with_hidden_size(args.hidden_size)
        .with_num_layers(args.num_layers);
    let model = PretrainedLanguageModel::<B>::from_scratch(config, vocab, &device)?;
    model.save(&args.zoo.source().model_dir())?;
    Ok(())
}

#[cfg(feature = "wgpu")]
mod backend {
    use burn::backend::wgpu::{AutoGraphicsApi, Wgpu, WgpuDevice};
    use burn::backend::Autodiff;

    pub type Inference = Wgpu<AutoGraphicsApi, f32, i32>;
    pub type Training = Autodiff<Inference>;

    pub fn device() -> WgpuDevice {
        WgpuDevice::default()
    }
}

#[cfg(not(feature = "wgpu"))]
mod backend {
    use burn::backend::ndarray::{NdArray, NdArrayDevice};
    use burn::backend::Autodiff;

    pub type Inference = NdArray<f32>;
    pub type Training = Autodiff<Inference>;

    pub fn device() -> NdArrayDevice {
        NdArrayDevice::Cpu
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("toxic_lstm=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let device = backend::device();
    match cli.command {
        Commands::Train(args) => run_train::<backend::Training>(args, device),
        Commands::Predict(args) => run_predict::<backend::Inference>(args, device),
        Commands::InitPretrained(args) => run_init_pretrained::<backend::Inference>(args, device),
    }
}
