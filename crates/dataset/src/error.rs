use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced while reading, validating or indexing a packed split.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("unknown split `{0}`, expected one of TRAIN, VAL, TEST")]
    UnknownSplit(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid image archive magic: found {found:?}")]
    InvalidMagic { found: [u8; 7] },
    #[error("unsupported image archive version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("packed split malformed: {0}")]
    Format(String),
    #[error("index {index} out of range for split of {len} entries")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("failed to load image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("invalid JSON sidecar: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Result alias for dataset operations.
pub type Result<T> = std::result::Result<T, DatasetError>;
