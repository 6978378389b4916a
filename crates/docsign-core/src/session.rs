//! Signing sessions
//!
//! [`SigningSessions`] drives collections and their signers through the
//! whole flow: creation, distribution, link redemption, identification,
//! field submission, signature application and completion. Every mutation
//! goes through [`CollectionStore::save`], so two requests racing on the
//! same collection cannot both win.

use crate::cache::OperationCache;
use crate::cleanup::{self, CleanupRegistry, JobKind};
use crate::collaborators::{
    store_new, BlobKind, Clock, DocumentStorage, IdentityProvider, Notification, Notifier,
    RemoteSigner,
};
use crate::config::{CompletionPolicy, EngineConfig};
use crate::credentials::ApiCredentials;
use crate::error::{Result, SigningError};
use crate::finalize::finalize_collection;
use crate::otp::{hash_password, OtpVerifier};
use crate::provisioning::{subject_for, CredentialProvisioner};
use crate::split::{SplitOutcome, SplitSignatureEngine};
use crate::store::{CollectionStore, SplitProcessStore};
use crate::tokens::TokenIssuer;
use chrono::{DateTime, Duration, Utc};
use shared_crypto::CertificateIssuer;
use shared_pdf::{normalized_to_pdf, PdfDocument};
use shared_types::{
    AuthMode, BlobId, CollectionId, CollectionStatus, ContactRef, CredentialOwner,
    DeclineReason, Document, DocumentCollection, DocumentId, DocumentSigningState,
    ExternalIdentity, FieldKind, FieldRef, FieldValue, HistoryAction, HistoryLog,
    NotificationFlags, OwnerRef, PdfField, SendingMethod, SignaturePlacement, Signer,
    SignerAttachment, SignerAuthentication, SignerId, SignerStatus, SignerTokenMapping,
    SigningOrder,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

// ============================================================
// Inputs and outputs
// ============================================================

/// A signer as described by the sender
#[derive(Debug, Clone)]
pub struct SignerDraft {
    pub id: SignerId,
    pub contact: ContactRef,
    pub sending_method: SendingMethod,
    pub auth_mode: AuthMode,
    /// Plain password for OTP modes that ask for one; hashed on creation
    pub password: Option<String>,
    pub attachments: Vec<SignerAttachment>,
    pub link_expiration_hours: Option<u32>,
    pub mandatory: bool,
    pub order: u32,
}

impl SignerDraft {
    /// Mandatory e-mail signer without identification
    pub fn new(name: &str, email: &str) -> Self {
        Self {
            id: SignerId::new(),
            contact: ContactRef {
                name: name.to_string(),
                email: Some(email.to_string()),
                phone: None,
            },
            sending_method: SendingMethod::Email,
            auth_mode: AuthMode::None,
            password: None,
            attachments: Vec::new(),
            link_expiration_hours: None,
            mandatory: true,
            order: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentDraft {
    pub name: String,
    pub pdf: Vec<u8>,
    pub fields: Vec<PdfField>,
}

#[derive(Debug, Clone)]
pub struct CollectionDraft {
    pub name: String,
    pub owner: OwnerRef,
    pub sender_ip: Option<String>,
    pub notifications: NotificationFlags,
    pub signing_order: SigningOrder,
    pub documents: Vec<DocumentDraft>,
    pub signers: Vec<SignerDraft>,
}

/// What a signer gets back for redeeming their link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerSession {
    pub collection_id: CollectionId,
    pub signer_id: SignerId,
    pub bearer: String,
    pub auth_token: String,
    pub auth_mode: AuthMode,
    pub status: SignerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    /// A code (and/or password prompt) was sent to `means`
    Code {
        means: String,
        expires_at: DateTime<Utc>,
    },
    /// The signer continues at the identity provider
    External { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Signed {
        signed_at: DateTime<Utc>,
        collection_status: CollectionStatus,
    },
    /// A remote party has to sign; resume with `token`
    Pending {
        document_id: DocumentId,
        token: String,
        url: String,
    },
}

/// Outside systems the sessions talk to
#[derive(Clone)]
pub struct Services {
    pub storage: Arc<dyn DocumentStorage>,
    pub notifier: Arc<dyn Notifier>,
    pub identity: Arc<dyn IdentityProvider>,
    pub clock: Arc<dyn Clock>,
}

// ============================================================
// Completion rules
// ============================================================

/// Status a collection should move to given its signers, if any.
///
/// A decline by a mandatory signer ends the collection. So does a
/// decline by an optional signer unless the policy tolerates it. An
/// expired link ends it too, except under partial completion, where the
/// decision waits until nobody else can still act.
pub fn next_collection_status(
    collection: &DocumentCollection,
    policy: CompletionPolicy,
) -> Option<CollectionStatus> {
    if collection.status.is_terminal() || collection.status == CollectionStatus::Created {
        return None;
    }

    let mut declined_by_user = false;
    let mut declined_by_expiry = false;
    for signer in &collection.signers {
        let SignerStatus::Declined { reason } = &signer.status else {
            continue;
        };
        if !signer.mandatory && policy.complete_with_declined_optional_signers {
            continue;
        }
        match reason {
            DeclineReason::ByUser { .. } => declined_by_user = true,
            DeclineReason::Expired => declined_by_expiry = true,
        }
    }

    let anyone_active = collection.signers.iter().any(|s| !s.status.is_terminal());
    if declined_by_user || (declined_by_expiry && (!policy.allow_partial_completion || !anyone_active))
    {
        return Some(CollectionStatus::Declined);
    }

    if !declined_by_expiry && collection.outstanding_mandatory_signers().next().is_none() {
        return Some(CollectionStatus::Signed);
    }

    if collection.status == CollectionStatus::Distributing
        && collection.signers.iter().any(|s| s.status.is_signed())
    {
        return Some(CollectionStatus::PartiallySigned);
    }
    None
}

/// Lowest-order signer still waiting for a link in a sequential flow
fn next_in_order(collection: &DocumentCollection) -> Option<SignerId> {
    collection
        .signers
        .iter()
        .filter(|s| !s.status.is_terminal())
        .min_by_key(|s| s.order)
        .filter(|s| s.status == SignerStatus::Pending)
        .map(|s| s.id)
}

fn missing_signer(id: SignerId) -> SigningError {
    SigningError::NotFound(format!("signer {}", id))
}

fn missing_document(id: DocumentId) -> SigningError {
    SigningError::NotFound(format!("document {}", id))
}

fn transition_signer(signer: &mut Signer, next: SignerStatus) -> Result<()> {
    if !signer.status.can_transition_to(&next) {
        return Err(SigningError::InvalidTransition(format!(
            "signer {} cannot move from {} to {}",
            signer.id,
            signer.status.label(),
            next.label()
        )));
    }
    tracing::debug!("Signer {}: {} -> {}", signer.id, signer.status.label(), next.label());
    signer.status = next;
    Ok(())
}

fn transition_collection(collection: &mut DocumentCollection, next: CollectionStatus) -> Result<()> {
    if !collection.status.can_transition_to(next) {
        return Err(SigningError::InvalidTransition(format!(
            "collection {} cannot move from {:?} to {:?}",
            collection.id, collection.status, next
        )));
    }
    tracing::info!("Collection {}: {:?} -> {:?}", collection.id, collection.status, next);
    collection.status = next;
    Ok(())
}

fn ensure_active(collection: &DocumentCollection) -> Result<()> {
    if collection.status.is_terminal() {
        return Err(SigningError::InvalidTransition(format!(
            "collection {} is {:?}",
            collection.id, collection.status
        )));
    }
    Ok(())
}

/// How a signer shows up in the history
fn actor(signer: &Signer) -> String {
    signer
        .contact
        .email
        .clone()
        .or_else(|| signer.contact.phone.clone())
        .unwrap_or_else(|| signer.contact.name.clone())
}

fn signed_outcome(collection: &DocumentCollection, signer_id: SignerId) -> Option<SubmitOutcome> {
    let signer = collection.signer(signer_id)?;
    match (&signer.status, signer.signed_at) {
        (SignerStatus::Signed, Some(signed_at)) => Some(SubmitOutcome::Signed {
            signed_at,
            collection_status: collection.status,
        }),
        _ => None,
    }
}

/// Reject values for fields the signer does not own or of the wrong kind
fn check_values(
    collection: &DocumentCollection,
    signer_id: SignerId,
    values: &BTreeMap<FieldRef, FieldValue>,
) -> Result<()> {
    for (field_ref, value) in values {
        let field = collection
            .document(field_ref.document_id)
            .and_then(|doc| doc.field(&field_ref.field_name))
            .filter(|f| f.signer_id == Some(signer_id))
            .ok_or_else(|| {
                SigningError::InvalidTransition(format!(
                    "field {} is not assigned to signer {}",
                    field_ref, signer_id
                ))
            })?;

        let is_signature = matches!(value, FieldValue::Signature { .. });
        if is_signature != (field.kind == FieldKind::Signature) {
            return Err(SigningError::InvalidTransition(format!(
                "field {} expects a {:?} value",
                field_ref, field.kind
            )));
        }
    }
    Ok(())
}

/// Every mandatory field has a value and every mandatory attachment a file
fn check_complete(collection: &DocumentCollection, signer: &Signer) -> Result<()> {
    for (doc, field) in collection.fields_for(signer.id) {
        if !field.mandatory {
            continue;
        }
        let field_ref = FieldRef::new(doc.id, &field.name);
        if !signer
            .field_values
            .get(&field_ref)
            .is_some_and(FieldValue::is_filled)
        {
            return Err(SigningError::InvalidTransition(format!(
                "mandatory field {} has no value",
                field_ref
            )));
        }
    }
    if let Some(attachment) = signer.missing_mandatory_attachments().next() {
        return Err(SigningError::InvalidTransition(format!(
            "mandatory attachment {} is missing",
            attachment.name
        )));
    }
    Ok(())
}

// ============================================================
// Side effects
// ============================================================

/// Work that only happens once the collection state it follows from is saved
#[derive(Debug)]
enum Effect {
    SendLink {
        signer: SignerId,
        expires_at: Option<DateTime<Utc>>,
        method: SendingMethod,
    },
    Notify(Notification),
    Revoke(SignerId),
    RevokeCollection,
    DropProcesses,
    RecordIdentity {
        signer: SignerId,
        identity: ExternalIdentity,
    },
}

#[derive(Debug, Default)]
struct Effects(Vec<Effect>);

impl Effects {
    fn push(&mut self, effect: Effect) {
        self.0.push(effect);
    }
}

// ============================================================
// Sessions
// ============================================================

pub struct SigningSessions {
    config: EngineConfig,
    storage: Arc<dyn DocumentStorage>,
    notifier: Arc<dyn Notifier>,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    collections: CollectionStore,
    tokens: Arc<TokenIssuer>,
    otp: OtpVerifier,
    credentials: ApiCredentials,
    provisioner: CredentialProvisioner,
    processes: Arc<SplitProcessStore>,
    split: SplitSignatureEngine,
    remote: Option<Arc<dyn RemoteSigner>>,
}

impl SigningSessions {
    pub fn new(config: EngineConfig, services: Services) -> Self {
        let Services {
            storage,
            notifier,
            identity,
            clock,
        } = services;
        let processes = Arc::new(SplitProcessStore::new());

        Self {
            collections: CollectionStore::new(),
            tokens: Arc::new(TokenIssuer::new(config.tokens.clone(), clock.clone())),
            otp: OtpVerifier::new(config.otp.clone(), clock.clone()),
            credentials: ApiCredentials::new(config.api_keys.clone()),
            provisioner: CredentialProvisioner::new(
                CertificateIssuer::new(config.crypto.issuer_settings()),
                storage.clone(),
                clock.clone(),
            ),
            split: SplitSignatureEngine::new(
                processes.clone(),
                clock.clone(),
                config.crypto.contents_capacity,
            ),
            processes,
            remote: None,
            config,
            storage,
            notifier,
            identity,
            clock,
        }
    }

    /// Sign every signer's fields with `remote` instead of provisioning
    /// a key store per signer
    pub fn with_remote_signer(mut self, remote: Arc<dyn RemoteSigner>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub fn collection(&self, id: CollectionId) -> Result<DocumentCollection> {
        self.collections.load(id)
    }

    /// Current revision of one document
    pub fn document_pdf(&self, collection_id: CollectionId, document_id: DocumentId) -> Result<Vec<u8>> {
        let collection = self.collections.load(collection_id)?;
        let doc = collection
            .document(document_id)
            .ok_or_else(|| missing_document(document_id))?;
        self.storage.get(BlobKind::Document, doc.content)
    }

    /// Merged PDF of a finalized collection
    pub fn final_artifact(&self, collection_id: CollectionId) -> Result<Vec<u8>> {
        let collection = self.collections.load(collection_id)?;
        let blob = collection.final_artifact.ok_or_else(|| {
            SigningError::NotFound(format!("final artifact of collection {}", collection_id))
        })?;
        self.storage.get(BlobKind::Document, blob)
    }

    /// Housekeeping jobs wired to this engine's stores
    pub fn cleanup_registry(&self) -> CleanupRegistry {
        let mut registry = CleanupRegistry::new(self.clock.clone());
        registry
            .register(
                JobKind::ScratchSweep,
                cleanup::ScratchSweep {
                    root: self.config.scratch_root.clone(),
                    max_age: Duration::hours(1),
                },
            )
            .register(
                JobKind::ExpiredTokens,
                cleanup::ExpiredTokens {
                    tokens: self.tokens.clone(),
                },
            )
            .register(
                JobKind::StaleSplitProcesses,
                cleanup::StaleSplitProcesses {
                    store: self.processes.clone(),
                    max_age: Duration::hours(self.config.tokens.session_ttl_hours),
                },
            );
        registry
    }

    // --------------------------------------------------------
    // Sender operations
    // --------------------------------------------------------

    /// Validate and store a new collection.
    ///
    /// # Arguments
    /// * `key`, `secret` - API credentials of the sender
    /// * `draft` - Documents, fields and signers
    ///
    /// # Returns
    /// Id of the collection, in status `Created`
    pub fn create_collection(&self, key: &str, secret: &str, draft: CollectionDraft) -> Result<CollectionId> {
        self.credentials.authorize(key, secret)?;

        if draft.documents.is_empty() {
            return Err(SigningError::InvalidFileContent(
                "collection has no documents".to_string(),
            ));
        }
        if !draft.signers.iter().any(|s| s.mandatory) {
            return Err(SigningError::InvalidTransition(
                "collection needs at least one mandatory signer".to_string(),
            ));
        }

        let mut signer_ids = HashSet::new();
        for signer in &draft.signers {
            if !signer_ids.insert(signer.id) {
                return Err(SigningError::Conflict(format!("signer {} listed twice", signer.id)));
            }
        }

        let collection_id = CollectionId::new();
        let mut page_counts = Vec::with_capacity(draft.documents.len());
        for doc in &draft.documents {
            let pdf = PdfDocument::from_bytes(&doc.pdf)
                .map_err(|e| SigningError::InvalidFileContent(format!("{}: {}", doc.name, e)))?;
            let page_count = pdf.page_count();

            let mut names = HashSet::new();
            for field in &doc.fields {
                if field.page == 0 || field.page > page_count {
                    return Err(SigningError::InvalidFileContent(format!(
                        "field {} of {} is on page {} of {}",
                        field.name, doc.name, field.page, page_count
                    )));
                }
                if !names.insert(field.name.as_str()) {
                    return Err(SigningError::Conflict(format!(
                        "field {} appears twice in {}",
                        field.name, doc.name
                    )));
                }
                if let Some(owner) = field.signer_id.filter(|id| !signer_ids.contains(id)) {
                    return Err(missing_signer(owner));
                }
            }
            page_counts.push(page_count);
        }

        let signers = draft
            .signers
            .into_iter()
            .map(|signer| -> Result<Signer> {
                let mut authentication = SignerAuthentication::new(signer.auth_mode.clone());
                if let AuthMode::Otp { otp_mode } = signer.auth_mode {
                    if otp_mode.requires_password() {
                        let password = signer.password.as_deref().ok_or_else(|| {
                            SigningError::InvalidCredential(format!(
                                "signer {} needs a password",
                                signer.id
                            ))
                        })?;
                        authentication.password_hash = Some(hash_password(password)?);
                    }
                }
                Ok(Signer {
                    id: signer.id,
                    contact: signer.contact,
                    status: SignerStatus::Pending,
                    sending_method: signer.sending_method,
                    authentication,
                    attachments: signer.attachments,
                    field_values: BTreeMap::new(),
                    signed_fields: BTreeSet::new(),
                    link_expiration_hours: signer.link_expiration_hours,
                    identification_attempts: 0,
                    mandatory: signer.mandatory,
                    order: signer.order,
                    sent_at: None,
                    signed_at: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut documents = Vec::with_capacity(draft.documents.len());
        for (doc, page_count) in draft.documents.into_iter().zip(page_counts) {
            let content = store_new(self.storage.as_ref(), BlobKind::Document, doc.pdf)?;
            documents.push(Document {
                id: DocumentId::new(),
                collection_id,
                name: doc.name,
                page_count,
                content,
                page_images: BTreeMap::new(),
                fields: doc.fields,
            });
        }

        let now = self.clock.now();
        let mut history = HistoryLog::new();
        history.append(
            now,
            HistoryAction::Created,
            &draft.owner.user_id,
            Some(format!("{} documents, {} signers", documents.len(), signers.len())),
        );

        self.collections.insert(DocumentCollection {
            id: collection_id,
            name: draft.name,
            owner: draft.owner,
            status: CollectionStatus::Created,
            created_at: now,
            signed_at: None,
            documents,
            signers,
            sender_ip: draft.sender_ip,
            notifications: draft.notifications,
            signing_order: draft.signing_order,
            final_artifact: None,
            version: 0,
            history,
        })?;

        tracing::info!("Created collection {}", collection_id);
        Ok(collection_id)
    }

    /// Send signing links.
    ///
    /// In parallel mode every signer gets a link at once; in sequential
    /// mode only the first one does and the rest follow as signers finish.
    pub fn distribute(&self, collection_id: CollectionId) -> Result<Vec<SignerTokenMapping>> {
        let mut collection = self.collections.load(collection_id)?;
        let now = self.clock.now();

        transition_collection(&mut collection, CollectionStatus::Distributing)?;
        collection
            .history
            .append(now, HistoryAction::Distributed, &collection.owner.user_id, None);

        let targets: Vec<SignerId> = match collection.signing_order {
            SigningOrder::Parallel => collection.signers.iter().map(|s| s.id).collect(),
            SigningOrder::Sequential => next_in_order(&collection).into_iter().collect(),
        };

        let mut effects = Effects::default();
        for signer_id in targets {
            self.send_link(&mut collection, signer_id, now, &mut effects)?;
        }
        self.commit(&mut collection, effects)
    }

    /// Cancel a collection that has not finished yet
    pub fn cancel(&self, key: &str, secret: &str, collection_id: CollectionId) -> Result<()> {
        self.credentials.authorize(key, secret)?;

        let mut collection = self.collections.load(collection_id)?;
        transition_collection(&mut collection, CollectionStatus::Canceled)?;
        collection.history.append(
            self.clock.now(),
            HistoryAction::Canceled,
            &format!("api:{}", key),
            None,
        );
        self.collections.save(&mut collection)?;

        let revoked = self.tokens.revoke_collection(collection_id)?;
        self.processes.remove_collection(collection_id)?;
        self.notifier.notify(Notification::Canceled {
            collection: collection_id,
        });
        tracing::info!("Canceled collection {} ({} sessions revoked)", collection_id, revoked);
        Ok(())
    }

    /// Build the final artifact of a signed collection, once
    pub fn finalize(&self, collection_id: CollectionId) -> Result<BlobId> {
        let mut collection = self.collections.load(collection_id)?;
        if let Some(existing) = collection.final_artifact {
            return Ok(existing);
        }
        let artifact = finalize_collection(
            &mut collection,
            self.storage.as_ref(),
            &self.config.scratch_root,
            self.clock.now(),
        )?;
        self.collections.save(&mut collection)?;
        Ok(artifact)
    }

    // --------------------------------------------------------
    // Signer operations
    // --------------------------------------------------------

    /// Redeem the session token from a signing link
    pub fn open(&self, session_token: &str) -> Result<SignerSession> {
        let (collection_id, signer_id) = self
            .tokens
            .peek_session_token(session_token)
            .ok_or_else(|| SigningError::InvalidCredential("Unknown session token".to_string()))?;

        let mut collection = self.collections.load(collection_id)?;
        let now = self.clock.now();
        self.expire_if_due(&mut collection, signer_id, now)?;
        ensure_active(&collection)?;

        let mapping = self.tokens.redeem_session_token(session_token)?;
        let bearer = mapping.bearer.clone().ok_or_else(|| {
            SigningError::InvalidCredential("no bearer was issued".to_string())
        })?;

        let flags = collection.notifications;
        let signer = collection
            .signer_mut(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        if signer.status == SignerStatus::Sent {
            transition_signer(signer, SignerStatus::Viewed)?;
            let actor = actor(signer);
            collection
                .history
                .append(now, HistoryAction::Viewed { signer: signer_id }, &actor, None);
            self.collections.save(&mut collection)?;
            if flags.on_view {
                self.notifier.notify(Notification::Viewed {
                    collection: collection_id,
                    signer: signer_id,
                });
            }
        }

        let signer = collection
            .signer(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        Ok(SignerSession {
            collection_id,
            signer_id,
            bearer,
            auth_token: mapping.auth_token,
            auth_mode: signer.authentication.mode.clone(),
            status: signer.status.clone(),
        })
    }

    /// Come back to an opened session with the auth token from [`SignerSession`].
    ///
    /// Any bearer handed out before stops working.
    pub fn resume_session(&self, auth_token: &str) -> Result<SignerSession> {
        let (collection_id, signer_id) = self.tokens.resolve_auth_token(auth_token)?;

        let mut collection = self.collections.load(collection_id)?;
        self.expire_if_due(&mut collection, signer_id, self.clock.now())?;
        ensure_active(&collection)?;

        let mapping = self.tokens.refresh_bearer(auth_token)?;
        let bearer = mapping.bearer.clone().ok_or_else(|| {
            SigningError::InvalidCredential("no bearer was issued".to_string())
        })?;

        let signer = collection
            .signer(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        tracing::debug!("Signer {} resumed their session", signer_id);
        Ok(SignerSession {
            collection_id,
            signer_id,
            bearer,
            auth_token: mapping.auth_token,
            auth_mode: signer.authentication.mode.clone(),
            status: signer.status.clone(),
        })
    }

    /// Start the identification step the signer's mode asks for
    pub fn begin_authentication(&self, bearer: &str) -> Result<AuthChallenge> {
        let (mut collection, signer_id, now) = self.signer_context(bearer)?;
        let collection_id = collection.id;

        let signer = collection
            .signer_mut(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        match signer.status {
            SignerStatus::Viewed => transition_signer(signer, SignerStatus::Authenticating)?,
            SignerStatus::Authenticating => {}
            _ => {
                return Err(SigningError::InvalidTransition(format!(
                    "signer {} is {}",
                    signer_id,
                    signer.status.label()
                )))
            }
        }

        let mut effects = Effects::default();
        let challenge = match signer.authentication.mode {
            AuthMode::None => {
                return Err(SigningError::InvalidTransition(format!(
                    "signer {} needs no identification",
                    signer_id
                )))
            }
            AuthMode::Otp { .. } => {
                let details = self.otp.issue_challenge(signer)?;
                effects.push(Effect::Notify(Notification::ChallengeIssued {
                    collection: collection_id,
                    signer: signer_id,
                    means: details.means.clone(),
                    code: details.code.clone(),
                }));
                AuthChallenge::Code {
                    means: details.means,
                    expires_at: details.expires_at,
                }
            }
            AuthMode::ExternalIdentity { .. } => AuthChallenge::External {
                url: self
                    .otp
                    .begin_external(collection_id, signer, self.identity.as_ref())?,
            },
        };

        let actor = actor(signer);
        collection.history.append(
            now,
            HistoryAction::ChallengeIssued { signer: signer_id },
            &actor,
            None,
        );
        self.commit(&mut collection, effects)?;
        Ok(challenge)
    }

    /// Answer an OTP challenge.
    ///
    /// Failed attempts are persisted before the error is returned.
    pub fn verify_code(&self, bearer: &str, code: Option<&str>, password: Option<&str>) -> Result<()> {
        let (mut collection, signer_id, now) = self.signer_context(bearer)?;

        let signer = collection
            .signer_mut(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        if signer.status != SignerStatus::Authenticating {
            return Err(SigningError::InvalidTransition(format!(
                "signer {} is {}",
                signer_id,
                signer.status.label()
            )));
        }

        let outcome = self.otp.verify(signer, code, password);
        let attempts = signer.identification_attempts;
        let actor = actor(signer);
        match &outcome {
            Ok(()) => collection.history.append(
                now,
                HistoryAction::Authenticated { signer: signer_id },
                &actor,
                None,
            ),
            Err(SigningError::InvalidCode) => collection.history.append(
                now,
                HistoryAction::AuthenticationFailed {
                    signer: signer_id,
                    attempts,
                },
                &actor,
                None,
            ),
            Err(_) => {}
        }
        self.collections.save(&mut collection)?;
        outcome
    }

    /// Accept the identity provider's assertion for the signer
    pub fn complete_external(&self, bearer: &str, assertion: &str) -> Result<ExternalIdentity> {
        let (mut collection, signer_id, now) = self.signer_context(bearer)?;

        let signer = collection
            .signer_mut(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        if signer.status != SignerStatus::Authenticating {
            return Err(SigningError::InvalidTransition(format!(
                "signer {} is {}",
                signer_id,
                signer.status.label()
            )));
        }

        let outcome = self
            .otp
            .record_assertion(signer, self.identity.as_ref(), assertion);
        let attempts = signer.identification_attempts;
        let actor = actor(signer);
        let mut effects = Effects::default();
        match &outcome {
            Ok(identity) => {
                effects.push(Effect::RecordIdentity {
                    signer: signer_id,
                    identity: identity.clone(),
                });
                collection.history.append(
                    now,
                    HistoryAction::Authenticated { signer: signer_id },
                    &actor,
                    Some(format!("{} ({})", identity.name, identity.id)),
                );
            }
            Err(_) => collection.history.append(
                now,
                HistoryAction::AuthenticationFailed {
                    signer: signer_id,
                    attempts,
                },
                &actor,
                None,
            ),
        }
        self.commit(&mut collection, effects)?;
        outcome
    }

    /// Store a file for one of the signer's attachments
    pub fn add_attachment(&self, bearer: &str, name: &str, bytes: Vec<u8>) -> Result<BlobId> {
        let (mut collection, signer_id, _) = self.signer_context(bearer)?;

        let signer = collection
            .signer_mut(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        if !matches!(
            signer.status,
            SignerStatus::Viewed | SignerStatus::Authenticating | SignerStatus::Signing
        ) {
            return Err(SigningError::InvalidTransition(format!(
                "signer {} is {}",
                signer_id,
                signer.status.label()
            )));
        }

        let blob = store_new(self.storage.as_ref(), BlobKind::Document, bytes)?;
        match signer.attachments.iter_mut().find(|a| a.name == name) {
            Some(attachment) => attachment.blob = Some(blob),
            None => signer.attachments.push(SignerAttachment {
                name: name.to_string(),
                mandatory: false,
                blob: Some(blob),
            }),
        }
        self.collections.save(&mut collection)?;
        Ok(blob)
    }

    /// Submit field values and apply the signer's signatures.
    ///
    /// Re-submitting for a signer that already signed returns the stored
    /// result and touches nothing.
    ///
    /// # Arguments
    /// * `bearer` - Credential from [`SigningSessions::open`]
    /// * `values` - Values keyed by field; signature fields take `FieldValue::Signature`
    /// * `cache` - Page geometry reused across the documents of this request
    pub fn submit(
        &self,
        bearer: &str,
        values: BTreeMap<FieldRef, FieldValue>,
        cache: &mut OperationCache,
    ) -> Result<SubmitOutcome> {
        let (collection_id, signer_id) = self.tokens.bearer_subject(bearer)?;
        if let Some(outcome) = signed_outcome(&self.collections.load(collection_id)?, signer_id) {
            tracing::debug!("Signer {} already signed", signer_id);
            return Ok(outcome);
        }

        let (mut collection, signer_id, now) = self.signer_context(bearer)?;
        check_values(&collection, signer_id, &values)?;

        let signer = collection
            .signer_mut(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        if !matches!(
            signer.status,
            SignerStatus::Viewed | SignerStatus::Authenticating | SignerStatus::Signing
        ) {
            return Err(SigningError::InvalidTransition(format!(
                "signer {} is {}",
                signer_id,
                signer.status.label()
            )));
        }
        if !signer.authentication.is_resolved() {
            return Err(SigningError::InvalidTransition(format!(
                "signer {} has not been identified",
                signer_id
            )));
        }
        signer.field_values.extend(values);

        let signer = collection
            .signer(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        check_complete(&collection, signer)?;

        let signer = collection
            .signer_mut(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        if signer.status != SignerStatus::Signing {
            transition_signer(signer, SignerStatus::Signing)?;
        }
        self.collections.save(&mut collection)?;

        self.sign_outstanding(collection, signer_id, now, cache)
    }

    /// Continue after a remote party signed the hash it was sent
    pub fn resume_external_signature(
        &self,
        token: &str,
        signed_hash: &[u8],
        cache: &mut OperationCache,
    ) -> Result<SubmitOutcome> {
        let parked = self.processes.get(token)?;
        let signer_id = parked.signer_id;
        let mut collection = self.collections.load(parked.collection_id)?;
        if let Some(outcome) = signed_outcome(&collection, signer_id) {
            return Ok(outcome);
        }

        let now = self.clock.now();
        self.expire_if_due(&mut collection, signer_id, now)?;
        ensure_active(&collection)?;
        let signer = collection
            .signer(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        if signer.status != SignerStatus::Signing {
            return Err(SigningError::InvalidTransition(format!(
                "signer {} is {}",
                signer_id,
                signer.status.label()
            )));
        }

        let current = collection
            .document(parked.document_id)
            .map(|doc| doc.content)
            .ok_or_else(|| missing_document(parked.document_id))?;
        let applied = parked.fields.iter().all(|f| {
            signer
                .signed_fields
                .contains(&FieldRef::new(parked.document_id, &f.placement.field_name))
        });
        if !applied && parked.base_revision.is_some_and(|base| base != current) {
            // The hash was taken over a revision that is no longer current
            tracing::warn!(
                "Document {} changed under process {}; preparing signer {} again",
                parked.document_id,
                token,
                signer_id
            );
            self.processes.remove(token)?;
            return self.sign_outstanding(collection, signer_id, now, cache);
        }

        let remote = self.remote_signer_for(&mut collection, signer_id)?;
        match self.split.resume(token, signed_hash, remote.as_ref())? {
            SplitOutcome::Completed(state) => {
                cache.invalidate(state.collection_id, state.document_id);
                self.apply_signed_document(&mut collection, state, now)?;
            }
            SplitOutcome::Pending { token, process } => {
                self.collections.save(&mut collection)?;
                return Ok(SubmitOutcome::Pending {
                    document_id: parked.document_id,
                    token,
                    url: process.url,
                })
            }
        }

        self.sign_outstanding(collection, signer_id, now, cache)
    }

    /// Refuse to sign. Ends the collection unless the policy tolerates it.
    pub fn decline(&self, bearer: &str, comment: Option<String>) -> Result<()> {
        let (mut collection, signer_id, now) = self.signer_context(bearer)?;

        let signer = collection
            .signer_mut(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        transition_signer(
            signer,
            SignerStatus::Declined {
                reason: DeclineReason::ByUser {
                    comment: comment.clone(),
                },
            },
        )?;
        let actor = actor(signer);
        collection.history.append(
            now,
            HistoryAction::Declined {
                signer: signer_id,
                expired: false,
            },
            &actor,
            comment,
        );
        let mut effects = Effects::default();
        effects.push(Effect::Revoke(signer_id));
        if collection.notifications.on_decline {
            effects.push(Effect::Notify(Notification::Declined {
                collection: collection.id,
                signer: signer_id,
                expired: false,
            }));
        }

        self.settle(&mut collection, now, &mut effects)?;
        self.commit(&mut collection, effects)?;
        tracing::info!("Signer {} declined collection {}", signer_id, collection.id);
        Ok(())
    }

    // --------------------------------------------------------
    // Internals
    // --------------------------------------------------------

    /// Resolve a bearer to its collection, applying link expiry first
    fn signer_context(&self, bearer: &str) -> Result<(DocumentCollection, SignerId, DateTime<Utc>)> {
        let (collection_id, signer_id) = self.tokens.bearer_subject(bearer)?;
        let mut collection = self.collections.load(collection_id)?;
        let now = self.clock.now();

        self.expire_if_due(&mut collection, signer_id, now)?;
        self.tokens.authenticate_bearer(bearer)?;
        ensure_active(&collection)?;
        Ok((collection, signer_id, now))
    }

    /// Decline a signer whose link ran out, then report `Expired`
    fn expire_if_due(
        &self,
        collection: &mut DocumentCollection,
        signer_id: SignerId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if collection.status.is_terminal() {
            return Ok(());
        }
        let signer = collection
            .signer_mut(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        if signer.status.is_terminal() || !signer.link_expired(now) {
            return Ok(());
        }

        tracing::warn!("Signing link of signer {} expired", signer_id);
        transition_signer(
            signer,
            SignerStatus::Declined {
                reason: DeclineReason::Expired,
            },
        )?;
        collection.history.append(
            now,
            HistoryAction::Declined {
                signer: signer_id,
                expired: true,
            },
            "system",
            None,
        );
        let mut effects = Effects::default();
        effects.push(Effect::Revoke(signer_id));
        if collection.notifications.on_decline {
            effects.push(Effect::Notify(Notification::Declined {
                collection: collection.id,
                signer: signer_id,
                expired: true,
            }));
        }

        self.settle(collection, now, &mut effects)?;
        self.commit(collection, effects)?;
        Err(SigningError::Expired("signing link expired".to_string()))
    }

    fn send_link(
        &self,
        collection: &mut DocumentCollection,
        signer_id: SignerId,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> Result<()> {
        let signer = collection
            .signer_mut(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        transition_signer(signer, SignerStatus::Sent)?;
        signer.sent_at = Some(now);

        effects.push(Effect::SendLink {
            signer: signer_id,
            expires_at: signer.link_expires_at(),
            method: signer.sending_method,
        });
        let actor = actor(signer);
        collection.history.append(
            now,
            HistoryAction::LinkSent { signer: signer_id },
            "system",
            Some(actor),
        );
        Ok(())
    }

    /// Save `collection`, then carry out the effects of the change.
    ///
    /// Nothing in `effects` happens when the save fails.
    ///
    /// # Returns
    /// Token mappings of the links that were sent
    fn commit(
        &self,
        collection: &mut DocumentCollection,
        effects: Effects,
    ) -> Result<Vec<SignerTokenMapping>> {
        self.collections.save(collection)?;

        let collection_id = collection.id;
        let mut links = Vec::new();
        for effect in effects.0 {
            match effect {
                Effect::SendLink {
                    signer,
                    expires_at,
                    method,
                } => {
                    let mapping = self.tokens.issue(collection_id, signer, expires_at)?;
                    self.notifier.notify(Notification::LinkSent {
                        collection: collection_id,
                        signer,
                        method,
                        session_token: mapping.session_token.clone(),
                    });
                    tracing::info!("Sent signing link to signer {} via {:?}", signer, method);
                    links.push(mapping);
                }
                Effect::Notify(notification) => self.notifier.notify(notification),
                Effect::Revoke(signer) => {
                    self.tokens.revoke(collection_id, signer)?;
                }
                Effect::RevokeCollection => {
                    self.tokens.revoke_collection(collection_id)?;
                }
                Effect::DropProcesses => {
                    self.processes.remove_collection(collection_id)?;
                }
                Effect::RecordIdentity { signer, identity } => {
                    self.tokens
                        .record_external_identity(collection_id, signer, identity)?;
                }
            }
        }
        Ok(links)
    }

    /// Apply the collection status the completion rules call for
    fn settle(
        &self,
        collection: &mut DocumentCollection,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> Result<()> {
        let Some(next) = next_collection_status(collection, self.config.completion) else {
            return Ok(());
        };
        transition_collection(collection, next)?;

        match next {
            CollectionStatus::Signed => {
                if collection.signed_at.is_none() {
                    collection.signed_at = Some(now);
                }
                collection
                    .history
                    .append(now, HistoryAction::Completed, "system", None);
                effects.push(Effect::RevokeCollection);
                if collection.notifications.on_complete {
                    effects.push(Effect::Notify(Notification::Completed {
                        collection: collection.id,
                    }));
                }
            }
            CollectionStatus::Declined => {
                effects.push(Effect::RevokeCollection);
                effects.push(Effect::DropProcesses);
            }
            _ => {}
        }

        if collection.signing_order == SigningOrder::Sequential && !collection.status.is_terminal() {
            if let Some(next_signer) = next_in_order(collection) {
                self.send_link(collection, next_signer, now, effects)?;
            }
        }
        Ok(())
    }

    fn remote_signer_for(
        &self,
        collection: &mut DocumentCollection,
        signer_id: SignerId,
    ) -> Result<Arc<dyn RemoteSigner>> {
        if let Some(remote) = &self.remote {
            return Ok(remote.clone());
        }

        let name = collection
            .signer(signer_id)
            .map(|s| s.contact.name.clone())
            .ok_or_else(|| missing_signer(signer_id))?;
        let subject = subject_for(&name, collection.owner.group_id.as_deref());
        let password = &self.config.crypto.key_store_password;
        let reference = self
            .provisioner
            .ensure(&CredentialOwner::Signer(signer_id), &subject, password)?;

        if let Some(signer) = collection.signer_mut(signer_id) {
            signer.authentication.remote_credential = Some(reference.blob);
        }
        Ok(Arc::new(self.provisioner.open_signer(&reference, password)?))
    }

    /// Signature placements still to apply, per document, with its bytes
    fn pending_placements(
        &self,
        collection: &DocumentCollection,
        signer: &Signer,
        cache: &mut OperationCache,
    ) -> Result<Vec<(DocumentId, BlobId, Vec<u8>, Vec<SignaturePlacement>)>> {
        let mut pending = Vec::new();
        for doc in &collection.documents {
            let fields: Vec<(&PdfField, Option<Vec<u8>>)> = doc
                .fields
                .iter()
                .filter(|f| f.signer_id == Some(signer.id) && f.kind == FieldKind::Signature)
                .filter_map(|f| {
                    let field_ref = FieldRef::new(doc.id, &f.name);
                    if signer.signed_fields.contains(&field_ref) {
                        return None;
                    }
                    match signer.field_values.get(&field_ref) {
                        Some(FieldValue::Signature { image }) => Some((f, image.clone())),
                        _ => None,
                    }
                })
                .collect();
            if fields.is_empty() {
                continue;
            }

            let pdf = self.storage.get(BlobKind::Document, doc.content)?;
            let placements = fields
                .into_iter()
                .map(|(field, image)| -> Result<SignaturePlacement> {
                    let media_box = cache.page_dimensions(collection.id, doc.id, field.page, &pdf)?;
                    Ok(SignaturePlacement {
                        field_name: field.name.clone(),
                        page: field.page,
                        rect: normalized_to_pdf(&field.rect, media_box),
                        signer_name: signer.contact.name.clone(),
                        reason: format!("Signed by {}", signer.contact.name),
                        image,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            pending.push((doc.id, doc.content, pdf, placements));
        }
        Ok(pending)
    }

    /// Sign every document that still has open fields for the signer
    fn sign_outstanding(
        &self,
        mut collection: DocumentCollection,
        signer_id: SignerId,
        now: DateTime<Utc>,
        cache: &mut OperationCache,
    ) -> Result<SubmitOutcome> {
        let remote = self.remote_signer_for(&mut collection, signer_id)?;
        let signer = collection
            .signer(signer_id)
            .cloned()
            .ok_or_else(|| missing_signer(signer_id))?;

        let pending = self.pending_placements(&collection, &signer, cache)?;
        for (document_id, base, pdf, placements) in pending {
            let outcome = self.split.begin(
                collection.id,
                document_id,
                signer_id,
                pdf,
                Some(base),
                placements,
                remote.as_ref(),
            );
            match outcome {
                Ok(SplitOutcome::Completed(state)) => {
                    cache.invalidate(collection.id, document_id);
                    self.apply_signed_document(&mut collection, state, now)?;
                }
                Ok(SplitOutcome::Pending { token, process }) => {
                    self.collections.save(&mut collection)?;
                    tracing::info!("Document {} waits for a remote signature", document_id);
                    return Ok(SubmitOutcome::Pending {
                        document_id,
                        token,
                        url: process.url,
                    });
                }
                Err(e) => {
                    self.collections.save(&mut collection)?;
                    return Err(e);
                }
            }
        }

        let mut effects = Effects::default();
        self.finish_signer(&mut collection, signer_id, now, &mut effects)?;
        self.commit(&mut collection, effects)?;

        if collection.status == CollectionStatus::Signed && collection.final_artifact.is_none() {
            finalize_collection(
                &mut collection,
                self.storage.as_ref(),
                &self.config.scratch_root,
                now,
            )?;
            self.collections.save(&mut collection)?;
        }

        Ok(SubmitOutcome::Signed {
            signed_at: now,
            collection_status: collection.status,
        })
    }

    /// Store a newly signed revision and mark its fields signed
    fn apply_signed_document(
        &self,
        collection: &mut DocumentCollection,
        state: DocumentSigningState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let signer_id = state.signer_id;
        let document_id = state.document_id;
        let field_refs: Vec<FieldRef> = state
            .fields
            .iter()
            .map(|f| FieldRef::new(document_id, &f.placement.field_name))
            .collect();

        let signer = collection
            .signer(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        if field_refs.iter().all(|f| signer.signed_fields.contains(f)) {
            return Ok(());
        }
        let doc = collection
            .document(document_id)
            .ok_or_else(|| missing_document(document_id))?;
        if state.base_revision.is_some_and(|base| base != doc.content) {
            return Err(SigningError::Conflict(format!(
                "document {} changed while signer {} was signing it",
                document_id, signer_id
            )));
        }

        let content = store_new(self.storage.as_ref(), BlobKind::Document, state.current_pdf)?;
        collection
            .document_mut(document_id)
            .ok_or_else(|| missing_document(document_id))?
            .content = content;

        let signer = collection
            .signer_mut(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        let actor = actor(signer);
        signer.signed_fields.extend(field_refs.iter().cloned());

        for field_ref in field_refs {
            collection.history.append(
                now,
                HistoryAction::FieldSigned {
                    signer: signer_id,
                    document: document_id,
                    field: field_ref.field_name,
                },
                &actor,
                None,
            );
        }
        Ok(())
    }

    fn finish_signer(
        &self,
        collection: &mut DocumentCollection,
        signer_id: SignerId,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> Result<()> {
        let signer = collection
            .signer(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        if !signer.authentication.is_resolved() {
            return Err(SigningError::InvalidTransition(format!(
                "signer {} has not been identified",
                signer_id
            )));
        }
        for (doc, field) in collection.fields_for(signer_id) {
            let field_ref = FieldRef::new(doc.id, &field.name);
            if field.mandatory
                && field.kind == FieldKind::Signature
                && !signer.signed_fields.contains(&field_ref)
            {
                return Err(SigningError::InvalidTransition(format!(
                    "signature field {} is not signed",
                    field_ref
                )));
            }
        }

        let collection_id = collection.id;
        let flags = collection.notifications;
        let signer = collection
            .signer_mut(signer_id)
            .ok_or_else(|| missing_signer(signer_id))?;
        transition_signer(signer, SignerStatus::Signed)?;
        if signer.signed_at.is_none() {
            signer.signed_at = Some(now);
        }
        let actor = actor(signer);
        collection
            .history
            .append(now, HistoryAction::Signed { signer: signer_id }, &actor, None);

        effects.push(Effect::Revoke(signer_id));
        if flags.on_sign {
            effects.push(Effect::Notify(Notification::Signed {
                collection: collection_id,
                signer: signer_id,
            }));
        }
        tracing::info!("Signer {} signed collection {}", signer_id, collection_id);

        self.settle(collection, now, effects)
    }
}
