use thiserror::Error;
use std::path::PathBuf;

use crate::types::DataType;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Allocation failed: {0}")]
    Allocation(String),

    #[error("Data type mismatch: tensor holds {actual}, requested {requested}")]
    DataTypeMismatch { actual: DataType, requested: DataType },

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Invalid operator: {0}")]
    InvalidOperator(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Failed to load model from {0}: {1}")]
    ModelLoadError(PathBuf, String),
}
