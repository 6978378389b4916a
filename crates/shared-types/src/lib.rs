//! Data model shared by the signing engine, the PDF crates and the CLI.

pub mod error;
pub mod history;
pub mod ids;
pub mod model;
pub mod signing;
pub mod status;

pub use error::ModelError;
pub use history::{HistoryAction, HistoryEvent, HistoryLog};
pub use ids::{BlobId, CollectionId, DocumentId, OperationId, SignerId};
pub use model::{
    ContactRef, CredentialOwner, Document, DocumentCollection, ExternalIdentity, FieldKind,
    FieldRef, FieldValue, KeyStoreRef, NormalizedRect, NotificationFlags, OtpDetails, OwnerRef,
    PdfField, Signer, SignerAttachment, SignerAuthentication, SignerTokenMapping,
};
pub use signing::{
    DocumentSigningState, PreparedSignaturePdf, SignatureFieldData, SignaturePlacement,
    SplitDocumentProcess,
};
pub use status::{
    AuthMode, ChallengeState, CollectionStatus, DeclineReason, FieldSigningStep, OtpMode,
    ProcessStep, SendingMethod, SignerStatus, SigningOrder,
};
