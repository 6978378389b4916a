use pdfjoin_core::PdfJoinError;
use shared_crypto::CryptoError;
use shared_pdf::PdfError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Invalid file content: {0}")]
    InvalidFileContent(String),

    #[error("Invalid code")]
    InvalidCode,

    #[error("Expired: {0}")]
    Expired(String),

    #[error("Too many failed attempts")]
    AttemptsExceeded,

    #[error("Cryptographic failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Concurrent modification of {0}")]
    Conflict(String),

    #[error("Signature validation failed: {0}")]
    ValidationFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl SigningError {
    /// The caller may retry the same step after fixing its input
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredential(_)
                | Self::InvalidCode
                | Self::Expired(_)
                | Self::AttemptsExceeded
                | Self::ValidationFailed(_)
                | Self::Conflict(_)
        )
    }
}

impl From<PdfError> for SigningError {
    fn from(e: PdfError) -> Self {
        match e {
            PdfError::Parse(reason) => SigningError::InvalidFileContent(reason),
            other => SigningError::InvalidFileContent(other.to_string()),
        }
    }
}

impl From<PdfJoinError> for SigningError {
    fn from(e: PdfJoinError) -> Self {
        match e {
            PdfJoinError::Scratch(io) => SigningError::Storage(io.to_string()),
            other => SigningError::InvalidFileContent(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SigningError>;
