pub mod data_processing;
pub mod error;
pub mod model;
pub mod pretrained;

pub mod inference;
pub mod training;

pub use data_processing::{CommentDataset, TestDataset};
pub use error::{Error, Result};
