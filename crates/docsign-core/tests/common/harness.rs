//! Engine wired to in-memory collaborators

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use docsign_core::{
    ApiKey, CollectionDraft, DocumentDraft, EngineConfig, InMemoryStorage, LocalKeyStoreSigner,
    ManualClock, RecordingNotifier, Services, SignerDraft, SigningSessions,
    StaticIdentityProvider,
};
use shared_crypto::{CertificateIssuer, IssuerSettings, RsaIdentity};
use shared_pdf::fixtures::create_test_pdf;
use shared_types::{
    FieldKind, FieldRef, FieldValue, NormalizedRect, NotificationFlags, OwnerRef, PdfField,
    SignerId, SigningOrder,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

pub const KEY: &str = "sender";
pub const SECRET: &str = "sender-secret";
pub const KEY_STORE_PASSWORD: &str = "pw";

pub struct Harness {
    pub sessions: SigningSessions,
    pub notifier: Arc<RecordingNotifier>,
    pub storage: Arc<InMemoryStorage>,
    pub clock: Arc<ManualClock>,
    pub identity: Arc<StaticIdentityProvider>,
    pub scratch: TempDir,
}

pub fn config(scratch: &TempDir) -> EngineConfig {
    let mut config = EngineConfig {
        scratch_root: scratch.path().to_path_buf(),
        api_keys: vec![ApiKey {
            key: KEY.to_string(),
            secret: SECRET.to_string(),
        }],
        ..EngineConfig::default()
    };
    config.crypto.pbkdf2_iterations = 1_000;
    config
}

pub fn key_store(dn: &str) -> Vec<u8> {
    CertificateIssuer::new(IssuerSettings {
        pbkdf2_iterations: 1_000,
        ..IssuerSettings::default()
    })
    .issue(dn, KEY_STORE_PASSWORD)
    .unwrap()
}

pub fn identity(dn: &str) -> RsaIdentity {
    RsaIdentity::open(&key_store(dn), KEY_STORE_PASSWORD).unwrap()
}

impl Harness {
    /// Engine that signs with one shared local key
    pub fn new() -> Self {
        Self::with(|config| config, |sessions| {
            sessions.with_remote_signer(Arc::new(LocalKeyStoreSigner::from_identity(identity(
                "CN=Test Signing,O=Docsign",
            ))))
        })
    }

    pub fn with(
        configure: impl FnOnce(EngineConfig) -> EngineConfig,
        build: impl FnOnce(SigningSessions) -> SigningSessions,
    ) -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        ));
        let identity = Arc::new(StaticIdentityProvider::new("https://idp.example.com/start"));

        let sessions = SigningSessions::new(
            configure(config(&scratch)),
            Services {
                storage: storage.clone(),
                notifier: notifier.clone(),
                identity: identity.clone(),
                clock: clock.clone(),
            },
        );

        Self {
            sessions: build(sessions),
            notifier,
            storage,
            clock,
            identity,
            scratch,
        }
    }

    /// Bearer for a signer whose link was sent
    pub fn open(&self, signer: SignerId) -> String {
        let token = self.notifier.last_session_token(signer).unwrap();
        self.sessions.open(&token).unwrap().bearer
    }
}

pub fn signature_field(name: &str, page: u32, signer: SignerId) -> PdfField {
    PdfField {
        name: name.to_string(),
        kind: FieldKind::Signature,
        page,
        rect: NormalizedRect::new(0.1, 0.7, 0.35, 0.08).unwrap(),
        signer_id: Some(signer),
        mandatory: true,
    }
}

pub fn text_field(name: &str, signer: SignerId, mandatory: bool) -> PdfField {
    PdfField {
        name: name.to_string(),
        kind: FieldKind::Text,
        page: 1,
        rect: NormalizedRect::new(0.1, 0.5, 0.4, 0.05).unwrap(),
        signer_id: Some(signer),
        mandatory,
    }
}

pub fn draft(signers: Vec<SignerDraft>, documents: Vec<DocumentDraft>) -> CollectionDraft {
    CollectionDraft {
        name: "Lease agreement".to_string(),
        owner: OwnerRef {
            user_id: "owner-1".to_string(),
            group_id: Some("Acme".to_string()),
        },
        sender_ip: Some("203.0.113.7".to_string()),
        notifications: NotificationFlags::default(),
        signing_order: SigningOrder::Parallel,
        documents,
        signers,
    }
}

/// One two-page document with a signature field per signer
pub fn document_for(signers: &[&SignerDraft]) -> DocumentDraft {
    DocumentDraft {
        name: "lease.pdf".to_string(),
        pdf: create_test_pdf(2, "Lease"),
        fields: signers
            .iter()
            .enumerate()
            .map(|(i, s)| signature_field(&format!("sig_{}", i + 1), 2, s.id))
            .collect(),
    }
}

/// Signature values for every signature field of `signer`
pub fn signatures_for(
    sessions: &SigningSessions,
    collection: shared_types::CollectionId,
    signer: SignerId,
) -> BTreeMap<FieldRef, FieldValue> {
    let collection = sessions.collection(collection).unwrap();
    collection
        .fields_for(signer)
        .filter(|(_, f)| f.kind == FieldKind::Signature)
        .map(|(doc, f)| {
            (
                FieldRef::new(doc.id, &f.name),
                FieldValue::Signature { image: None },
            )
        })
        .collect()
}
