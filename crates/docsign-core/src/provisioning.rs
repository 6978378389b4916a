//! Lazy key-store provisioning
//!
//! A signer or company gets a certificate the first time one is needed.
//! The sealed key store goes to [`DocumentStorage`] and later calls reuse
//! it; the private key never leaves the sealed blob.

use crate::collaborators::{lock, BlobKind, Clock, DocumentStorage, LocalKeyStoreSigner};
use crate::error::Result;
use shared_crypto::CertificateIssuer;
use shared_types::{BlobId, CredentialOwner, KeyStoreRef};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub struct CredentialProvisioner {
    issuer: CertificateIssuer,
    storage: Arc<dyn DocumentStorage>,
    clock: Arc<dyn Clock>,
    issued: Mutex<BTreeMap<CredentialOwner, KeyStoreRef>>,
}

/// Escape RFC 4514 special characters in an attribute value
fn escape_dn_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        match c {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                escaped.push('\\');
                escaped.push(c);
            }
            '#' | ' ' if i == 0 => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped.trim_end().to_string()
}

/// Subject for a signer certificate
pub fn subject_for(common_name: &str, organization: Option<&str>) -> String {
    let cn = escape_dn_value(common_name);
    let cn = if cn.is_empty() { "Unnamed signer".to_string() } else { cn };
    match organization.map(escape_dn_value).filter(|o| !o.is_empty()) {
        Some(org) => format!("CN={},O={}", cn, org),
        None => format!("CN={}", cn),
    }
}

impl CredentialProvisioner {
    pub fn new(
        issuer: CertificateIssuer,
        storage: Arc<dyn DocumentStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            issuer,
            storage,
            clock,
            issued: Mutex::new(BTreeMap::new()),
        }
    }

    /// Return the owner's key store, issuing one on first use.
    ///
    /// # Arguments
    /// * `owner` - Signer or company the certificate belongs to
    /// * `subject` - Distinguished name used when a certificate is issued
    /// * `password` - Seals the private key
    pub fn ensure(&self, owner: &CredentialOwner, subject: &str, password: &str) -> Result<KeyStoreRef> {
        if let Some(existing) = lock(&self.issued)?.get(owner) {
            return Ok(existing.clone());
        }

        // Issued outside the lock; concurrent first uses race and the first insert wins
        let blob = self.issuer.issue(subject, password)?;
        let blob_id = BlobId::new();
        self.storage.put(BlobKind::KeyStore, blob_id, blob)?;

        let mut issued = lock(&self.issued)?;
        if let Some(existing) = issued.get(owner) {
            self.storage.delete(BlobKind::KeyStore, blob_id)?;
            return Ok(existing.clone());
        }

        let reference = KeyStoreRef {
            blob: blob_id,
            owner: owner.clone(),
            subject: subject.to_string(),
            created_at: self.clock.now(),
        };
        issued.insert(owner.clone(), reference.clone());
        tracing::info!("Provisioned key store {} for {:?}", blob_id, owner);
        Ok(reference)
    }

    pub fn lookup(&self, owner: &CredentialOwner) -> Option<KeyStoreRef> {
        self.issued.lock().ok().and_then(|i| i.get(owner).cloned())
    }

    /// Open the stored key store as a local signer
    pub fn open_signer(&self, reference: &KeyStoreRef, password: &str) -> Result<LocalKeyStoreSigner> {
        let blob = self.storage.get(BlobKind::KeyStore, reference.blob)?;
        LocalKeyStoreSigner::open(&blob, password)
    }
}
