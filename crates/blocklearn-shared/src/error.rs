use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}
