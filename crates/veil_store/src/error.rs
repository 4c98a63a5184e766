use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Upload already in progress or asset exists: {0}")]
    Conflict(String),

    #[error("Chunk index {index} out of range (total {total})")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("Missing chunk {0}")]
    MissingChunk(u32),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Asset too large: {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("Not permitted: {0}")]
    Forbidden(String),
}
