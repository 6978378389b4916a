//! Document signing core logic
//!
//! This crate runs multi-party signing of PDF collections: signer
//! identification, tokens, split (hash-then-sign) signature application,
//! completion rules and the final merged artifact. Storage, notification
//! delivery, identity providers and remote signing are traits supplied by
//! the embedding service.

pub mod cache;
pub mod cleanup;
pub mod collaborators;
pub mod config;
pub mod credentials;
pub mod error;
pub mod finalize;
pub mod otp;
pub mod provisioning;
pub mod session;
pub mod split;
pub mod store;
pub mod tokens;

pub use cache::OperationCache;
pub use cleanup::{CleanupHandler, CleanupRegistry, JobKind, JobReport};
pub use collaborators::{
    BlobKind, Clock, DeferredSigner, DocumentStorage, IdentityProvider, InMemoryStorage,
    LocalKeyStoreSigner, ManualClock, Notification, Notifier, RecordingNotifier, RemoteSignature,
    RemoteSigner, SignRequest, StaticIdentityProvider, SystemClock,
};
pub use config::{ApiKey, CompletionPolicy, CryptoSettings, EngineConfig, OtpSettings, TokenSettings};
pub use credentials::ApiCredentials;
pub use error::{Result, SigningError};
pub use finalize::finalize_collection;
pub use otp::OtpVerifier;
pub use provisioning::{subject_for, CredentialProvisioner};
pub use session::{
    next_collection_status, AuthChallenge, CollectionDraft, DocumentDraft, Services,
    SignerDraft, SignerSession, SigningSessions, SubmitOutcome,
};
pub use split::{SplitOutcome, SplitSignatureEngine};
pub use store::{CollectionStore, SplitProcessStore};
pub use tokens::{extract_bearer_token, BearerClaims, TokenIssuer};
