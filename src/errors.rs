use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Server responded with status {status}")]
    Protocol {
        status: u16,
    },

    #[error("Crypto config error: {0}")]
    CryptoConfig(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid item: {0}")]
    InvalidItem(String),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Queue shut down")]
    QueueShutdown,
}

impl TransferError {
    pub fn crypto_config(message: impl Into<String>) -> Self {
        Self::CryptoConfig(message.into())
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto(message.into())
    }

    /// Status code for `Protocol` failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Protocol { status } => Some(*status),
            _ => None,
        }
    }
}

/// Error alias
pub type Result<T, E = TransferError> = std::result::Result<T, E>;
