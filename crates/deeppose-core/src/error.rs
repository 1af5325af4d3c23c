//! Error types for the DeepPose workspace.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Image decoding error: {0}")]
    Image(String),

    #[error("Model loading error: {0}")]
    ModelLoad(String),

    #[error("No object model for category {category}")]
    MissingObjectModel { category: u32 },

    #[error("Image {image_id} has no annotations")]
    NoAnnotations { image_id: u64 },

    #[error("Index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Projection failed: vertex {index} has zero depth")]
    DegenerateProjection { index: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
