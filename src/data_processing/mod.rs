mod batcher;
mod dataset;
mod preprocess;
mod sampler;
mod tokenizer;

pub use batcher::*;
pub use dataset::*;
pub use preprocess::*;
pub use sampler::*;
pub use tokenizer::*;
