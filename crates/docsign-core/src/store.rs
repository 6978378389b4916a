//! In-process state stores
//!
//! `CollectionStore` guards every save with an optimistic version check;
//! `SplitProcessStore` holds suspended split-signature state by
//! continuation token.

use crate::collaborators::lock;
use crate::error::{Result, SigningError};
use chrono::{DateTime, Utc};
use shared_types::{CollectionId, DocumentCollection, DocumentSigningState};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct CollectionStore {
    collections: Mutex<HashMap<CollectionId, DocumentCollection>>,
}

impl CollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, collection: DocumentCollection) -> Result<()> {
        let mut collections = lock(&self.collections)?;
        if collections.contains_key(&collection.id) {
            return Err(SigningError::Conflict(format!(
                "collection {} already exists",
                collection.id
            )));
        }
        collections.insert(collection.id, collection);
        Ok(())
    }

    /// Snapshot of a collection; edit it and hand it back to [`CollectionStore::save`]
    pub fn load(&self, id: CollectionId) -> Result<DocumentCollection> {
        lock(&self.collections)?
            .get(&id)
            .cloned()
            .ok_or_else(|| SigningError::NotFound(format!("collection {}", id)))
    }

    /// Persist `collection` if nobody saved since it was loaded.
    ///
    /// # Returns
    /// The new version
    pub fn save(&self, collection: &mut DocumentCollection) -> Result<u64> {
        let mut collections = lock(&self.collections)?;
        let stored = collections
            .get_mut(&collection.id)
            .ok_or_else(|| SigningError::NotFound(format!("collection {}", collection.id)))?;

        if stored.version != collection.version {
            tracing::warn!(
                "Version conflict on collection {}: stored {}, saving {}",
                collection.id,
                stored.version,
                collection.version
            );
            return Err(SigningError::Conflict(format!("collection {}", collection.id)));
        }

        collection.version += 1;
        *stored = collection.clone();
        Ok(collection.version)
    }

    pub fn len(&self) -> usize {
        self.collections.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct StoredProcess {
    state: DocumentSigningState,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SplitProcessStore {
    processes: Mutex<HashMap<String, StoredProcess>>,
}

impl SplitProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, token: &str, state: DocumentSigningState, at: DateTime<Utc>) -> Result<()> {
        lock(&self.processes)?.insert(
            token.to_string(),
            StoredProcess {
                state,
                updated_at: at,
            },
        );
        Ok(())
    }

    pub fn get(&self, token: &str) -> Result<DocumentSigningState> {
        lock(&self.processes)?
            .get(token)
            .map(|p| p.state.clone())
            .ok_or_else(|| SigningError::NotFound(format!("signing process {}", token)))
    }

    pub fn remove(&self, token: &str) -> Result<Option<DocumentSigningState>> {
        Ok(lock(&self.processes)?.remove(token).map(|p| p.state))
    }

    /// Drop every process belonging to `collection`
    pub fn remove_collection(&self, collection: CollectionId) -> Result<usize> {
        let mut processes = lock(&self.processes)?;
        let before = processes.len();
        processes.retain(|_, p| p.state.collection_id != collection);
        Ok(before - processes.len())
    }

    /// Drop processes not touched since `cutoff`
    pub fn remove_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut processes = lock(&self.processes)?;
        let before = processes.len();
        processes.retain(|_, p| p.updated_at >= cutoff);
        Ok(before - processes.len())
    }

    pub fn len(&self) -> usize {
        self.processes.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use shared_types::{
        CollectionStatus, DocumentId, HistoryLog, NotificationFlags, OwnerRef, SignerId,
        SigningOrder,
    };

    fn collection() -> DocumentCollection {
        DocumentCollection {
            id: CollectionId::new(),
            name: "Lease".to_string(),
            owner: OwnerRef {
                user_id: "owner".to_string(),
                group_id: None,
            },
            status: CollectionStatus::Created,
            created_at: Utc::now(),
            signed_at: None,
            documents: vec![],
            signers: vec![],
            sender_ip: None,
            notifications: NotificationFlags::default(),
            signing_order: SigningOrder::Parallel,
            final_artifact: None,
            version: 0,
            history: HistoryLog::new(),
        }
    }

    fn signing_state(collection_id: CollectionId) -> DocumentSigningState {
        DocumentSigningState {
            collection_id,
            document_id: DocumentId::new(),
            signer_id: SignerId::new(),
            base_revision: None,
            certificate: vec![],
            current_pdf: vec![],
            fields: vec![],
            number_of_signatures: 0,
            number_of_signatures_signed: 0,
            process: None,
        }
    }

    #[test]
    fn test_save_bumps_version() {
        let store = CollectionStore::new();
        let c = collection();
        store.insert(c.clone()).unwrap();

        let mut loaded = store.load(c.id).unwrap();
        loaded.status = CollectionStatus::Distributing;
        assert_eq!(store.save(&mut loaded).unwrap(), 1);
        assert_eq!(store.load(c.id).unwrap().status, CollectionStatus::Distributing);
    }

    #[test]
    fn test_stale_save_conflicts() {
        let store = CollectionStore::new();
        let c = collection();
        store.insert(c.clone()).unwrap();

        let mut first = store.load(c.id).unwrap();
        let mut second = store.load(c.id).unwrap();
        store.save(&mut first).unwrap();

        assert!(matches!(store.save(&mut second), Err(SigningError::Conflict(_))));
    }

    #[test]
    fn test_missing_collection() {
        let store = CollectionStore::new();
        assert!(matches!(
            store.load(CollectionId::new()),
            Err(SigningError::NotFound(_))
        ));
        assert!(store.insert(collection()).is_ok());
    }

    #[test]
    fn test_processes_expire_by_age() {
        let store = SplitProcessStore::new();
        let now = Utc::now();
        let collection = CollectionId::new();
        store.put("old", signing_state(collection), now - Duration::hours(5)).unwrap();
        store.put("new", signing_state(collection), now).unwrap();

        assert_eq!(store.remove_older_than(now - Duration::hours(1)).unwrap(), 1);
        assert!(store.get("old").is_err());
        assert!(store.get("new").is_ok());
        assert_eq!(store.remove_collection(collection).unwrap(), 1);
        assert!(store.is_empty());
    }
}
