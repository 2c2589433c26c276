use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid segment file name: {0}")]
    SegmentName(String),

    #[error("Staging pool exhausted")]
    StagingExhausted,

    #[error("Staging buffer too small: {have} bytes for a {need} byte segment")]
    StagingTooSmall { have: usize, need: usize },

    #[error("Corrupted frame: {0}")]
    CorruptedFrame(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
