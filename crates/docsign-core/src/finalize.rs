//! Final artifact of a signed collection

use crate::collaborators::{store_new, BlobKind, DocumentStorage};
use crate::error::{Result, SigningError};
use chrono::{DateTime, Utc};
use pdfjoin_core::package_documents;
use shared_types::{BlobId, CollectionStatus, DocumentCollection, HistoryAction, OperationId};
use std::path::Path;

/// Flatten and merge every document of a signed collection.
///
/// The artifact is stored only after packaging succeeded, so a failure
/// leaves nothing behind.
///
/// # Returns
/// Blob id of the merged PDF, also recorded on `collection`
pub fn finalize_collection(
    collection: &mut DocumentCollection,
    storage: &dyn DocumentStorage,
    scratch_root: &Path,
    now: DateTime<Utc>,
) -> Result<BlobId> {
    if collection.status != CollectionStatus::Signed {
        return Err(SigningError::InvalidTransition(format!(
            "collection {} is {:?}, not signed",
            collection.id, collection.status
        )));
    }
    if let Some(existing) = collection.final_artifact {
        return Ok(existing);
    }

    let inputs = collection
        .documents
        .iter()
        .map(|doc| storage.get(BlobKind::Document, doc.content))
        .collect::<Result<Vec<_>>>()?;

    let operation_id = OperationId::new();
    let output = package_documents(&inputs, scratch_root, operation_id)?;
    let artifact = store_new(storage, BlobKind::Document, output.pdf)?;

    collection.final_artifact = Some(artifact);
    collection.history.append(
        now,
        HistoryAction::Finalized,
        "system",
        Some(format!(
            "{} documents, {} pages",
            collection.documents.len(),
            output.page_count
        )),
    );
    tracing::info!(
        "Finalized collection {} into {} ({} pages)",
        collection.id,
        artifact,
        output.page_count
    );
    Ok(artifact)
}
