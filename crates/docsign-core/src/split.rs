//! Split-signature protocol
//!
//! Each signature field goes `Prepared -> Hashed -> AwaitingExternalSignature
//! -> Assembled -> Verified`. The digest that needs a private key leaves the
//! engine through [`RemoteSigner`]; when the remote party answers later,
//! the whole [`DocumentSigningState`] is parked in the [`SplitProcessStore`]
//! under a continuation token and no lock is held until [`SplitSignatureEngine::resume`].

use crate::collaborators::{Clock, RemoteSignature, RemoteSigner, SignRequest};
use crate::error::{Result, SigningError};
use crate::store::SplitProcessStore;
use shared_crypto::{assemble, verify_detached, verify_prehashed, SignedAttributes};
use shared_pdf::{byte_range_digest, extract_signatures, inject_signature, prepare_signature};
use shared_types::{
    BlobId, CollectionId, DocumentId, DocumentSigningState, FieldSigningStep, ProcessStep,
    SignatureFieldData, SignaturePlacement, SignerId, SplitDocumentProcess,
};
use std::sync::Arc;
use uuid::Uuid;

/// Result of driving a document as far as possible
#[derive(Debug, Clone, PartialEq)]
pub enum SplitOutcome {
    /// Every field verified
    Completed(DocumentSigningState),
    /// Waiting on the remote signer; resume with `token`
    Pending {
        token: String,
        process: SplitDocumentProcess,
    },
}

enum FieldProgress {
    Verified,
    Suspended(String),
}

pub struct SplitSignatureEngine {
    store: Arc<SplitProcessStore>,
    clock: Arc<dyn Clock>,
    contents_capacity: usize,
}

impl SplitSignatureEngine {
    pub fn new(store: Arc<SplitProcessStore>, clock: Arc<dyn Clock>, contents_capacity: usize) -> Self {
        Self {
            store,
            clock,
            contents_capacity,
        }
    }

    /// Start signing `placements` on `pdf`.
    ///
    /// # Arguments
    /// * `pdf` - Current revision of the document
    /// * `base_revision` - Stored blob `pdf` was read from, if any
    /// * `placements` - One entry per signature field, signed in order
    /// * `remote` - Produces the signatures; may defer
    pub fn begin(
        &self,
        collection_id: CollectionId,
        document_id: DocumentId,
        signer_id: SignerId,
        pdf: Vec<u8>,
        base_revision: Option<BlobId>,
        placements: Vec<SignaturePlacement>,
        remote: &dyn RemoteSigner,
    ) -> Result<SplitOutcome> {
        let mut state = DocumentSigningState {
            collection_id,
            document_id,
            signer_id,
            base_revision,
            certificate: remote.certificate_der()?,
            current_pdf: pdf,
            fields: placements.into_iter().map(SignatureFieldData::new).collect(),
            number_of_signatures: 0,
            number_of_signatures_signed: 0,
            process: None,
        };
        state.refresh_counts();

        let token = Uuid::new_v4().simple().to_string();
        self.drive(state, &token, remote)
    }

    /// Continue a suspended process with the remote party's signature.
    ///
    /// A process that already finished returns its stored state without
    /// touching the PDF again.
    pub fn resume(
        &self,
        token: &str,
        signed_hash: &[u8],
        remote: &dyn RemoteSigner,
    ) -> Result<SplitOutcome> {
        let mut state = self.store.get(token)?;

        if state
            .process
            .as_ref()
            .is_some_and(|p| p.step == ProcessStep::Success)
        {
            tracing::debug!("Process {} already finished", token);
            return Ok(SplitOutcome::Completed(state));
        }

        let index = state
            .fields
            .iter()
            .position(|f| !f.is_terminal())
            .ok_or_else(|| SigningError::InvalidTransition(format!("process {} has no open field", token)))?;

        if let Err(e) = complete_field(&mut state, index, signed_hash) {
            self.store.put(token, state, self.clock.now())?;
            return Err(e);
        }
        self.drive(state, token, remote)
    }

    fn drive(
        &self,
        mut state: DocumentSigningState,
        token: &str,
        remote: &dyn RemoteSigner,
    ) -> Result<SplitOutcome> {
        for index in 0..state.fields.len() {
            if state.fields[index].is_terminal() {
                continue;
            }

            match self.advance_field(&mut state, index, token, remote)? {
                FieldProgress::Verified => state.refresh_counts(),
                FieldProgress::Suspended(url) => {
                    let process = SplitDocumentProcess {
                        url,
                        step: ProcessStep::InProgress,
                    };
                    state.process = Some(process.clone());
                    state.refresh_counts();
                    self.store.put(token, state, self.clock.now())?;
                    tracing::info!(
                        "Field {} awaiting external signature ({})",
                        index,
                        token
                    );
                    return Ok(SplitOutcome::Pending {
                        token: token.to_string(),
                        process,
                    });
                }
            }
        }

        state.refresh_counts();
        if let Some(process) = state.process.as_mut() {
            process.step = ProcessStep::Success;
            self.store.put(token, state.clone(), self.clock.now())?;
        }

        tracing::info!(
            "Document {} fully signed ({}/{} signatures)",
            state.document_id,
            state.number_of_signatures_signed,
            state.number_of_signatures
        );
        Ok(SplitOutcome::Completed(state))
    }

    fn advance_field(
        &self,
        state: &mut DocumentSigningState,
        index: usize,
        token: &str,
        remote: &dyn RemoteSigner,
    ) -> Result<FieldProgress> {
        if state.fields[index].step < FieldSigningStep::Hashed {
            self.hash_field(state, index)?;
        }

        let field = &mut state.fields[index];
        let hash = field
            .hash
            .clone()
            .ok_or_else(|| SigningError::InvalidTransition("field has no hash".to_string()))?;
        field.step = FieldSigningStep::AwaitingExternalSignature;

        let request = SignRequest {
            collection_id: state.collection_id,
            document_id: state.document_id,
            signer_id: state.signer_id,
            field_name: field.placement.field_name.clone(),
            hash,
            token: token.to_string(),
        };

        match remote.sign(&request)? {
            RemoteSignature::Completed(signed_hash) => {
                complete_field(state, index, &signed_hash)?;
                Ok(FieldProgress::Verified)
            }
            RemoteSignature::Pending(url) => Ok(FieldProgress::Suspended(url)),
        }
    }

    /// Write the placeholder and compute the digest the signer commits to
    fn hash_field(&self, state: &mut DocumentSigningState, index: usize) -> Result<()> {
        let now = self.clock.now();
        let field = &mut state.fields[index];

        let prepared = prepare_signature(
            &state.current_pdf,
            &field.placement,
            self.contents_capacity,
            now,
        )?;
        field.step = FieldSigningStep::Prepared;
        tracing::debug!(
            "Prepared {} with byte range {:?}",
            field.placement.field_name,
            prepared.byte_range
        );

        let document_digest = byte_range_digest(&prepared.pdf, &prepared.byte_range)?;
        let attributes = SignedAttributes::build(&document_digest, &state.certificate, now)?;

        field.hash = Some(attributes.hash()?);
        field.signed_attributes = Some(attributes.to_der()?);
        field.document_digest = Some(document_digest.to_vec());
        field.prepared = Some(prepared);
        field.signed_hash = None;
        field.signed_cms = None;
        field.step = FieldSigningStep::Hashed;
        Ok(())
    }
}

fn validation_failed(field: &mut SignatureFieldData, reason: String) -> SigningError {
    tracing::warn!(
        "Signature on {} rejected: {}",
        field.placement.field_name,
        reason
    );
    field.rewind_to_hashed();
    SigningError::ValidationFailed(reason)
}

/// Assemble, embed and verify the signature for one hashed field.
///
/// A terminal field is left untouched. On any validation failure the
/// field returns to `Hashed`.
fn complete_field(state: &mut DocumentSigningState, index: usize, signed_hash: &[u8]) -> Result<()> {
    let certificate = &state.certificate;
    let field = &mut state.fields[index];
    if field.is_terminal() {
        return Ok(());
    }

    let (Some(prepared), Some(hash), Some(attributes_der), Some(document_digest)) = (
        field.prepared.clone(),
        field.hash.clone(),
        field.signed_attributes.clone(),
        field.document_digest.clone(),
    ) else {
        return Err(SigningError::InvalidTransition(format!(
            "field {} was never hashed",
            field.placement.field_name
        )));
    };

    if let Err(e) = verify_prehashed(certificate, &hash, signed_hash) {
        return Err(validation_failed(field, e.to_string()));
    }
    field.signed_hash = Some(signed_hash.to_vec());

    let attributes = SignedAttributes::from_der(&attributes_der)?;
    let cms = assemble(&attributes, signed_hash, certificate)?;
    let signed_pdf = inject_signature(&prepared, &cms)?;
    field.signed_cms = Some(cms);
    field.step = FieldSigningStep::Assembled;

    let embedded = extract_signatures(&signed_pdf)?
        .into_iter()
        .find(|s| s.field_name == field.placement.field_name);
    let Some(embedded) = embedded else {
        return Err(validation_failed(
            field,
            "embedded signature not found".to_string(),
        ));
    };
    if embedded.byte_range != prepared.byte_range || !embedded.covers_whole_document {
        return Err(validation_failed(
            field,
            format!("unexpected byte range {:?}", embedded.byte_range),
        ));
    }
    let digest = byte_range_digest(&signed_pdf, &embedded.byte_range)?;
    if digest.as_slice() != document_digest.as_slice() {
        return Err(validation_failed(field, "document digest changed".to_string()));
    }
    if let Err(e) = verify_detached(&embedded.contents, &digest) {
        return Err(validation_failed(field, e.to_string()));
    }

    field.is_pdf_signed_by_this_signature = true;
    field.step = FieldSigningStep::Verified;
    tracing::info!("Verified signature on {}", field.placement.field_name);
    state.current_pdf = signed_pdf;
    Ok(())
}
