use shared_pdf::PdfError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PdfJoinError {
    #[error("Failed to parse PDF: {0}")]
    ParseError(String),

    #[error("Document {index} cannot be loaded: {reason}")]
    InvalidFileContent { index: usize, reason: String },

    #[error("PDF operation failed: {0}")]
    OperationError(String),

    #[error("Scratch storage error: {0}")]
    Scratch(#[from] std::io::Error),

    #[error(transparent)]
    Pdf(#[from] PdfError),
}
