//! Per-field split-signature data and suspended-process bookkeeping

use crate::ids::{BlobId, CollectionId, DocumentId, SignerId};
use crate::status::{FieldSigningStep, ProcessStep};
use serde::{Deserialize, Serialize};

/// A PDF with a signature placeholder and a fixed byte range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedSignaturePdf {
    pub pdf: Vec<u8>,
    /// `[start1, len1, start2, len2]` covering everything but `/Contents`
    pub byte_range: [u64; 4],
    /// Bytes available for the DER signature container
    pub contents_capacity: usize,
}

/// Where a signature widget goes, in PDF user-space units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignaturePlacement {
    pub field_name: String,
    /// 1-indexed page number
    pub page: u32,
    /// `[x, y, width, height]` with a bottom-left origin
    pub rect: [f64; 4],
    pub signer_name: String,
    pub reason: String,
    pub image: Option<Vec<u8>>,
}

/// State of one signature field within a signing attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureFieldData {
    pub placement: SignaturePlacement,
    pub step: FieldSigningStep,
    pub prepared: Option<PreparedSignaturePdf>,
    /// SHA-256 over the prepared byte range
    pub document_digest: Option<Vec<u8>>,
    /// DER of the signed attributes the external signer commits to
    pub signed_attributes: Option<Vec<u8>>,
    /// Digest handed to the external signer
    pub hash: Option<Vec<u8>>,
    pub signed_hash: Option<Vec<u8>>,
    pub signed_cms: Option<Vec<u8>>,
    pub is_pdf_signed_by_this_signature: bool,
}

impl SignatureFieldData {
    pub fn new(placement: SignaturePlacement) -> Self {
        Self {
            placement,
            step: FieldSigningStep::Pending,
            prepared: None,
            document_digest: None,
            signed_attributes: None,
            hash: None,
            signed_hash: None,
            signed_cms: None,
            is_pdf_signed_by_this_signature: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.is_pdf_signed_by_this_signature
    }

    /// Drop everything produced after hashing so the field can retry
    pub fn rewind_to_hashed(&mut self) {
        self.signed_hash = None;
        self.signed_cms = None;
        self.is_pdf_signed_by_this_signature = false;
        self.step = FieldSigningStep::Hashed;
    }
}

/// Continuation token for a suspended remote step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitDocumentProcess {
    pub url: String,
    pub step: ProcessStep,
}

/// Everything the split engine persists for one (document, signer) pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSigningState {
    pub collection_id: CollectionId,
    pub document_id: DocumentId,
    pub signer_id: SignerId,
    /// Stored revision `current_pdf` started from, when it came from storage
    #[serde(default)]
    pub base_revision: Option<BlobId>,
    /// DER certificate the signatures are made with
    pub certificate: Vec<u8>,
    /// Latest revision, including every verified signature so far
    pub current_pdf: Vec<u8>,
    pub fields: Vec<SignatureFieldData>,
    pub number_of_signatures: usize,
    pub number_of_signatures_signed: usize,
    pub process: Option<SplitDocumentProcess>,
}

impl DocumentSigningState {
    pub fn is_fully_signed(&self) -> bool {
        self.number_of_signatures_signed == self.number_of_signatures
    }

    /// Recount terminal fields
    pub fn refresh_counts(&mut self) {
        self.number_of_signatures = self.fields.len();
        self.number_of_signatures_signed = self.fields.iter().filter(|f| f.is_terminal()).count();
    }
}
