use thiserror::Error;

pub type Result<T> = std::result::Result<T, NegotiationError>;

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Untrusted sender: {0}")]
    UntrustedSender(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl NegotiationError {
    /// Errors that are expected noise on a shared channel rather than faults.
    pub fn is_benign(&self) -> bool {
        matches!(self, NegotiationError::UntrustedSender(_))
    }
}

impl From<serde_json::Error> for NegotiationError {
    fn from(err: serde_json::Error) -> Self {
        NegotiationError::Serialization(err.to_string())
    }
}

impl From<alloy_signer::Error> for NegotiationError {
    fn from(err: alloy_signer::Error) -> Self {
        NegotiationError::Signing(err.to_string())
    }
}

impl From<std::io::Error> for NegotiationError {
    fn from(err: std::io::Error) -> Self {
        NegotiationError::Io(err.to_string())
    }
}
