//! Collections, documents, signers and their authentication material

use crate::error::ModelError;
use crate::history::HistoryLog;
use crate::ids::{BlobId, CollectionId, DocumentId, SignerId};
use crate::status::{
    AuthMode, ChallengeState, CollectionStatus, OtpMode, SendingMethod, SignerStatus, SigningOrder,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// User (and optionally group) that owns a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub user_id: String,
    pub group_id: Option<String>,
}

/// Which events the sender wants to hear about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationFlags {
    pub on_view: bool,
    pub on_sign: bool,
    pub on_complete: bool,
    pub on_decline: bool,
}

impl Default for NotificationFlags {
    fn default() -> Self {
        Self {
            on_view: false,
            on_sign: true,
            on_complete: true,
            on_decline: true,
        }
    }
}

/// A batch of documents distributed together to a set of signers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentCollection {
    pub id: CollectionId,
    pub name: String,
    pub owner: OwnerRef,
    pub status: CollectionStatus,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, when every mandatory signer has signed
    pub signed_at: Option<DateTime<Utc>>,
    pub documents: Vec<Document>,
    pub signers: Vec<Signer>,
    pub sender_ip: Option<String>,
    pub notifications: NotificationFlags,
    pub signing_order: SigningOrder,
    /// Blob holding the merged, flattened final artifact
    pub final_artifact: Option<BlobId>,
    /// Optimistic concurrency counter, bumped on every successful save
    pub version: u64,
    pub history: HistoryLog,
}

impl DocumentCollection {
    pub fn signer(&self, id: SignerId) -> Option<&Signer> {
        self.signers.iter().find(|s| s.id == id)
    }

    pub fn signer_mut(&mut self, id: SignerId) -> Option<&mut Signer> {
        self.signers.iter_mut().find(|s| s.id == id)
    }

    pub fn document(&self, id: DocumentId) -> Option<&Document> {
        self.documents.iter().find(|d| d.id == id)
    }

    pub fn document_mut(&mut self, id: DocumentId) -> Option<&mut Document> {
        self.documents.iter_mut().find(|d| d.id == id)
    }

    /// Every field assigned to `signer`, paired with its document
    pub fn fields_for(&self, signer: SignerId) -> impl Iterator<Item = (&Document, &PdfField)> {
        self.documents.iter().flat_map(move |doc| {
            doc.fields
                .iter()
                .filter(move |f| f.signer_id == Some(signer))
                .map(move |f| (doc, f))
        })
    }

    /// Mandatory signers that have not signed yet
    pub fn outstanding_mandatory_signers(&self) -> impl Iterator<Item = &Signer> {
        self.signers
            .iter()
            .filter(|s| s.mandatory && !s.status.is_signed())
    }
}

/// Field categories found on a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Signature,
    Text,
    Checkbox,
    Radio,
    Choice,
}

/// Rectangle in page-relative coordinates, every component within [0, 1].
///
/// The origin is the top-left corner of the page, matching how the
/// placement UI records positions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRect {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

impl NormalizedRect {
    /// Build a rectangle, rejecting anything that leaves the unit square
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Result<Self, ModelError> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !(in_unit(x) && in_unit(y) && in_unit(width) && in_unit(height))
            || x + width > 1.0 + f64::EPSILON
            || y + height > 1.0 + f64::EPSILON
        {
            return Err(ModelError::InvalidCoordinates {
                x,
                y,
                width,
                height,
            });
        }
        Ok(Self {
            x,
            y,
            width,
            height,
        })
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn height(&self) -> f64 {
        self.height
    }
}

/// A form field placed on a document page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfField {
    pub name: String,
    pub kind: FieldKind,
    /// 1-indexed page number
    pub page: u32,
    pub rect: NormalizedRect,
    pub signer_id: Option<SignerId>,
    pub mandatory: bool,
}

/// One document of a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub collection_id: CollectionId,
    pub name: String,
    pub page_count: u32,
    /// Current revision of the PDF bytes
    pub content: BlobId,
    /// Rendered page images, produced lazily by page number
    pub page_images: BTreeMap<u32, BlobId>,
    pub fields: Vec<PdfField>,
}

impl Document {
    pub fn field(&self, name: &str) -> Option<&PdfField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// How to reach a signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRef {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// File a signer attached (or must attach) while signing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerAttachment {
    pub name: String,
    pub mandatory: bool,
    pub blob: Option<BlobId>,
}

/// Value a signer entered for a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Checked(bool),
    Choice(String),
    /// Request to apply a signature, optionally with a drawn image
    Signature { image: Option<Vec<u8>> },
}

impl FieldValue {
    /// Whether the value satisfies a mandatory field
    pub fn is_filled(&self) -> bool {
        match self {
            Self::Text(text) | Self::Choice(text) => !text.trim().is_empty(),
            Self::Checked(checked) => *checked,
            Self::Signature { .. } => true,
        }
    }
}

/// Address of a field across a collection.
///
/// Serialized as `"<document-id>/<field-name>"` so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct FieldRef {
    pub document_id: DocumentId,
    pub field_name: String,
}

impl FieldRef {
    pub fn new(document_id: DocumentId, field_name: impl Into<String>) -> Self {
        Self {
            document_id,
            field_name: field_name.into(),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.document_id, self.field_name)
    }
}

impl From<FieldRef> for String {
    fn from(field: FieldRef) -> Self {
        field.to_string()
    }
}

impl TryFrom<String> for FieldRef {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (document, name) = value
            .split_once('/')
            .ok_or_else(|| ModelError::InvalidFieldRef(value.clone()))?;
        let document_id = document
            .parse()
            .map_err(|_| ModelError::InvalidFieldRef(value.clone()))?;
        Ok(Self::new(document_id, name))
    }
}

/// One-time challenge issued to a signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpDetails {
    /// Phone number or e-mail address the code is delivered to
    pub means: String,
    pub code: Option<String>,
    pub attempts: u32,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub mode: OtpMode,
}

impl OtpDetails {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Identity asserted by an external provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIdentity {
    pub name: String,
    pub id: String,
}

/// Everything needed to decide whether a signer has proven who they are
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerAuthentication {
    pub mode: AuthMode,
    pub state: ChallengeState,
    pub otp: Option<OtpDetails>,
    /// Argon2 PHC string, required when the OTP mode asks for a password
    pub password_hash: Option<String>,
    pub external_identity: Option<ExternalIdentity>,
    /// Key store used to sign on this signer's behalf
    pub remote_credential: Option<BlobId>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl SignerAuthentication {
    pub fn new(mode: AuthMode) -> Self {
        Self {
            mode,
            state: ChallengeState::Idle,
            otp: None,
            password_hash: None,
            external_identity: None,
            remote_credential: None,
            verified_at: None,
        }
    }

    /// True once the mode's requirement is satisfied
    pub fn is_resolved(&self) -> bool {
        match self.mode {
            AuthMode::None => true,
            AuthMode::Otp { .. } | AuthMode::ExternalIdentity { .. } => {
                self.state == ChallengeState::Verified
            }
        }
    }
}

/// A party asked to authenticate and sign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signer {
    pub id: SignerId,
    pub contact: ContactRef,
    pub status: SignerStatus,
    pub sending_method: SendingMethod,
    pub authentication: SignerAuthentication,
    pub attachments: Vec<SignerAttachment>,
    pub field_values: BTreeMap<FieldRef, FieldValue>,
    /// Signature fields whose embedded signature has been verified
    pub signed_fields: BTreeSet<FieldRef>,
    pub link_expiration_hours: Option<u32>,
    pub identification_attempts: u32,
    pub mandatory: bool,
    /// Position in a sequential signing order
    pub order: u32,
    pub sent_at: Option<DateTime<Utc>>,
    pub signed_at: Option<DateTime<Utc>>,
}

impl Signer {
    /// The moment the signing link stops working, if it expires at all
    pub fn link_expires_at(&self) -> Option<DateTime<Utc>> {
        let hours = self.link_expiration_hours?;
        let sent = self.sent_at?;
        Some(sent + Duration::hours(i64::from(hours)))
    }

    pub fn link_expired(&self, now: DateTime<Utc>) -> bool {
        self.link_expires_at().is_some_and(|at| now >= at)
    }

    pub fn missing_mandatory_attachments(&self) -> impl Iterator<Item = &SignerAttachment> {
        self.attachments
            .iter()
            .filter(|a| a.mandatory && a.blob.is_none())
    }
}

/// Tokens handed to a signer for the duration of their turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerTokenMapping {
    pub collection_id: CollectionId,
    pub signer_id: SignerId,
    /// Embedded in the signing link, redeemable once
    pub session_token: String,
    /// Long-lived token identifying the signer across requests
    pub auth_token: String,
    /// Signed bearer credential issued when the session token is redeemed
    pub bearer: Option<String>,
    pub external_identity: Option<ExternalIdentity>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub session_token_used: bool,
    pub revoked: bool,
}

impl SignerTokenMapping {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }
}

/// Who a stored key store belongs to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CredentialOwner {
    Signer(SignerId),
    Company(String),
}

/// Reference to a password-protected key store held in storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStoreRef {
    pub blob: BlobId,
    pub owner: CredentialOwner,
    pub subject: String,
    pub created_at: DateTime<Utc>,
}
