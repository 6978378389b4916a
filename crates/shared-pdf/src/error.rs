use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PdfError {
    #[error("Failed to parse PDF: {0}")]
    Parse(String),

    #[error("Page {0} not found")]
    PageNotFound(u32),

    #[error("Malformed PDF structure: {0}")]
    Malformed(String),

    #[error("Failed to save PDF: {0}")]
    Save(String),

    #[error("Signature placeholder not found: {0}")]
    PlaceholderNotFound(String),

    #[error("Signature too large: {size} bytes (max {capacity})")]
    SignatureTooLarge { size: usize, capacity: usize },

    #[error("Invalid byte range {0:?}")]
    InvalidByteRange([u64; 4]),
}

pub type Result<T> = std::result::Result<T, PdfError>;
