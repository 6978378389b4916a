//! Seams to the outside world
//!
//! Storage, notification delivery, identity providers, remote signing and
//! the clock are traits so the engine can run against real services or
//! the in-memory versions below.

use crate::error::{Result, SigningError};
use chrono::{DateTime, Duration, Utc};
use shared_crypto::{RsaIdentity, SigningIdentity};
use shared_types::{
    BlobId, CollectionId, DocumentId, ExternalIdentity, SendingMethod, SignerId,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| SigningError::Storage("lock poisoned".to_string()))
}

// ============================================================
// Clock
// ============================================================

/// Source of "now" for every expiry decision
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

// ============================================================
// Document storage
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlobKind {
    Document,
    PageImage,
    KeyStore,
}

/// Byte storage addressed by kind and id
pub trait DocumentStorage: Send + Sync {
    fn put(&self, kind: BlobKind, id: BlobId, bytes: Vec<u8>) -> Result<()>;
    fn get(&self, kind: BlobKind, id: BlobId) -> Result<Vec<u8>>;
    fn delete(&self, kind: BlobKind, id: BlobId) -> Result<()>;
}

/// Store `bytes` under a fresh id
pub fn store_new(storage: &dyn DocumentStorage, kind: BlobKind, bytes: Vec<u8>) -> Result<BlobId> {
    let id = BlobId::new();
    storage.put(kind, id, bytes)?;
    Ok(id)
}

#[derive(Debug, Default)]
pub struct InMemoryStorage {
    blobs: Mutex<HashMap<(BlobKind, BlobId), Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs of `kind`
    pub fn count(&self, kind: BlobKind) -> usize {
        self.blobs
            .lock()
            .map(|blobs| blobs.keys().filter(|(k, _)| *k == kind).count())
            .unwrap_or(0)
    }
}

impl DocumentStorage for InMemoryStorage {
    fn put(&self, kind: BlobKind, id: BlobId, bytes: Vec<u8>) -> Result<()> {
        lock(&self.blobs)?.insert((kind, id), bytes);
        Ok(())
    }

    fn get(&self, kind: BlobKind, id: BlobId) -> Result<Vec<u8>> {
        lock(&self.blobs)?
            .get(&(kind, id))
            .cloned()
            .ok_or_else(|| SigningError::NotFound(format!("{:?} blob {}", kind, id)))
    }

    fn delete(&self, kind: BlobKind, id: BlobId) -> Result<()> {
        lock(&self.blobs)?.remove(&(kind, id));
        Ok(())
    }
}

// ============================================================
// Notifications
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Signing link for a signer; the token goes into the link
    LinkSent {
        collection: CollectionId,
        signer: SignerId,
        method: SendingMethod,
        session_token: String,
    },
    /// One-time code (when the mode uses one) delivered to `means`
    ChallengeIssued {
        collection: CollectionId,
        signer: SignerId,
        means: String,
        code: Option<String>,
    },
    Viewed {
        collection: CollectionId,
        signer: SignerId,
    },
    Signed {
        collection: CollectionId,
        signer: SignerId,
    },
    Declined {
        collection: CollectionId,
        signer: SignerId,
        expired: bool,
    },
    Completed {
        collection: CollectionId,
    },
    Canceled {
        collection: CollectionId,
    },
}

/// Fire-and-forget delivery
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Keeps every notification for later inspection
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Most recent one-time code sent to `signer`
    pub fn last_code(&self, signer: SignerId) -> Option<String> {
        self.sent().into_iter().rev().find_map(|n| match n {
            Notification::ChallengeIssued {
                signer: to, code, ..
            } if to == signer => code,
            _ => None,
        })
    }

    /// Most recent session token sent to `signer`
    pub fn last_session_token(&self, signer: SignerId) -> Option<String> {
        self.sent().into_iter().rev().find_map(|n| match n {
            Notification::LinkSent {
                signer: to,
                session_token,
                ..
            } if to == signer => Some(session_token),
            _ => None,
        })
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        tracing::debug!("Notification: {:?}", notification);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
    }
}

// ============================================================
// External identity
// ============================================================

pub trait IdentityProvider: Send + Sync {
    /// Start a hand-off and return the URL the signer is sent to
    fn begin(&self, collection: CollectionId, signer: SignerId) -> Result<String>;

    /// Check an opaque assertion returned by the provider
    fn validate(&self, assertion: &str) -> Result<ExternalIdentity>;
}

/// Provider that accepts a fixed set of assertions
#[derive(Debug)]
pub struct StaticIdentityProvider {
    base_url: String,
    accepted: Mutex<HashMap<String, ExternalIdentity>>,
}

impl StaticIdentityProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            accepted: Mutex::new(HashMap::new()),
        }
    }

    pub fn accept(&self, assertion: impl Into<String>, identity: ExternalIdentity) {
        if let Ok(mut accepted) = self.accepted.lock() {
            accepted.insert(assertion.into(), identity);
        }
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn begin(&self, collection: CollectionId, signer: SignerId) -> Result<String> {
        Ok(format!("{}/{}/{}", self.base_url, collection, signer))
    }

    fn validate(&self, assertion: &str) -> Result<ExternalIdentity> {
        lock(&self.accepted)?
            .get(assertion)
            .cloned()
            .ok_or_else(|| SigningError::InvalidCredential("assertion rejected".to_string()))
    }
}

// ============================================================
// Remote signing
// ============================================================

/// A digest to be signed on behalf of a signer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub collection_id: CollectionId,
    pub document_id: DocumentId,
    pub signer_id: SignerId,
    pub field_name: String,
    /// SHA-256 of the DER signed attributes
    pub hash: Vec<u8>,
    /// Continuation token the result must be resumed with
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSignature {
    /// PKCS#1 v1.5 signature over the request hash
    Completed(Vec<u8>),
    /// The signer finishes elsewhere; resume with the request token
    Pending(String),
}

pub trait RemoteSigner: Send + Sync {
    /// Certificate matching the key that will sign
    fn certificate_der(&self) -> Result<Vec<u8>>;

    fn sign(&self, request: &SignRequest) -> Result<RemoteSignature>;
}

/// Signs immediately with a key store held by the engine
pub struct LocalKeyStoreSigner {
    identity: RsaIdentity,
}

impl LocalKeyStoreSigner {
    pub fn open(blob: &[u8], password: &str) -> Result<Self> {
        Ok(Self {
            identity: RsaIdentity::open(blob, password)?,
        })
    }

    pub fn from_identity(identity: RsaIdentity) -> Self {
        Self { identity }
    }

    pub fn signer_name(&self) -> Option<String> {
        self.identity.signer_name()
    }
}

impl RemoteSigner for LocalKeyStoreSigner {
    fn certificate_der(&self) -> Result<Vec<u8>> {
        Ok(self.identity.certificate_der().to_vec())
    }

    fn sign(&self, request: &SignRequest) -> Result<RemoteSignature> {
        Ok(RemoteSignature::Completed(
            self.identity.sign_prehashed(&request.hash)?,
        ))
    }
}

/// Parks every request and answers with a continuation URL.
///
/// [`DeferredSigner::complete`] plays the part of the remote party
/// returning later with the signed hash.
pub struct DeferredSigner {
    identity: RsaIdentity,
    base_url: String,
    pending: Mutex<HashMap<String, SignRequest>>,
}

impl DeferredSigner {
    pub fn new(identity: RsaIdentity, base_url: impl Into<String>) -> Self {
        Self {
            identity,
            base_url: base_url.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Sign the parked request for `token`
    pub fn complete(&self, token: &str) -> Result<Vec<u8>> {
        let request = lock(&self.pending)?
            .remove(token)
            .ok_or_else(|| SigningError::NotFound(format!("pending request {}", token)))?;
        Ok(self.identity.sign_prehashed(&request.hash)?)
    }
}

impl RemoteSigner for DeferredSigner {
    fn certificate_der(&self) -> Result<Vec<u8>> {
        Ok(self.identity.certificate_der().to_vec())
    }

    fn sign(&self, request: &SignRequest) -> Result<RemoteSignature> {
        lock(&self.pending)?.insert(request.token.clone(), request.clone());
        Ok(RemoteSignature::Pending(format!(
            "{}?token={}",
            self.base_url, request.token
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_storage_round_trip() {
        let storage = InMemoryStorage::new();
        let id = store_new(&storage, BlobKind::Document, b"pdf".to_vec()).unwrap();

        assert_eq!(storage.get(BlobKind::Document, id).unwrap(), b"pdf");
        assert!(matches!(
            storage.get(BlobKind::KeyStore, id),
            Err(SigningError::NotFound(_))
        ));

        storage.delete(BlobKind::Document, id).unwrap();
        assert_eq!(storage.count(BlobKind::Document), 0);
    }

    #[test]
    fn test_recording_notifier_finds_latest_code() {
        let notifier = RecordingNotifier::new();
        let collection = CollectionId::new();
        let signer = SignerId::new();
        for code in ["111111", "222222"] {
            notifier.notify(Notification::ChallengeIssued {
                collection,
                signer,
                means: "alice@example.com".to_string(),
                code: Some(code.to_string()),
            });
        }
        assert_eq!(notifier.last_code(signer), Some("222222".to_string()));
        assert_eq!(notifier.last_code(SignerId::new()), None);
    }

    #[test]
    fn test_static_provider() {
        let provider = StaticIdentityProvider::new("https://idp.example.com");
        provider.accept(
            "good",
            ExternalIdentity {
                name: "Alice".to_string(),
                id: "alice-1".to_string(),
            },
        );
        assert_eq!(provider.validate("good").unwrap().id, "alice-1");
        assert!(matches!(
            provider.validate("forged"),
            Err(SigningError::InvalidCredential(_))
        ));
    }
}
