//! Error types for the vector engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SvdbError>;

#[derive(Error, Debug)]
pub enum SvdbError {
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Not found")]
    NotFound,

    #[error("Insufficient training data: {0}")]
    InsufficientTrainingData(String),

    #[error("Corrupt segment: {0}")]
    CorruptSegment(String),

    #[error("Corrupt manifest: {0}")]
    CorruptManifest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Concurrent modification: another writer holds the engine")]
    ConcurrentModification,
}
