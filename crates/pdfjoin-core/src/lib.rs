//! PDF flatten and merge packaging
//!
//! This crate turns a set of signed documents into the final artifact:
//! signature fields are flattened per document, the results are staged
//! in a per-operation scratch directory and merged with lopdf.

pub mod error;
pub mod merge;
pub mod package;
pub mod scratch;

pub use error::PdfJoinError;
pub use merge::{merge_documents, merge_loaded};
pub use package::{flatten_document, package_documents, PackageOutput};
pub use scratch::ScratchSpace;

/// Parse PDF bytes and return page count
pub fn get_page_count(bytes: &[u8]) -> Result<u32, PdfJoinError> {
    let doc =
        lopdf::Document::load_mem(bytes).map_err(|e| PdfJoinError::ParseError(e.to_string()))?;
    Ok(doc.get_pages().len() as u32)
}
