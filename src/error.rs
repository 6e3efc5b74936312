use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Cache hint {stamp} timed out")]
    HintTimeout { stamp: u64 },

    #[error("Cache hint {stamp} rejected by peer")]
    HintRejected { stamp: u64 },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Block source error: {0}")]
    Source(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl TransferError {
    /// Whether this error ends the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransferError::HintTimeout { .. }
                | TransferError::HintRejected { .. }
                | TransferError::ChannelClosed(_)
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TransferError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        TransferError::ChannelClosed("receiver dropped".to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
