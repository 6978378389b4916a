use thiserror::Error;

/// Failure while generating, packaging, signing with or checking key material
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid distinguished name: {0}")]
    InvalidName(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Encoding failed: {0}")]
    Encoding(String),

    #[error("Key store could not be opened: {0}")]
    KeyStore(String),

    #[error("Malformed signature container: {0}")]
    MalformedSignature(String),

    #[error("Signature does not verify: {0}")]
    VerificationFailed(String),
}

impl From<der::Error> for CryptoError {
    fn from(e: der::Error) -> Self {
        CryptoError::Encoding(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CryptoError>;
