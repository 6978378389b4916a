//! Shared PDF handling utilities
//!
//! Parsing, coordinate transformation, signature placeholders and
//! field flattening used by the signing and packaging crates.

pub mod coords;
pub mod document;
pub mod error;
pub mod fields;
pub mod flatten;
pub mod signature;

#[cfg(any(test, feature = "test-util"))]
pub mod fixtures;

pub use coords::{normalized_to_pdf, pdf_to_normalized};
pub use document::PdfDocument;
pub use error::PdfError;
pub use fields::{FieldArena, FieldEntry};
pub use flatten::{flatten, FlattenReport};
pub use signature::{
    add_signature_fields, byte_range_digest, extract_signatures, inject_signature,
    prepare_signature, signed_content, EmbeddedSignature, FieldSpec, DEFAULT_CONTENTS_CAPACITY,
};
