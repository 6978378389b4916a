//! Hash-chained history of a document collection.
//!
//! Each entry commits to its predecessor's hash, so rewriting any past
//! entry breaks `verify` for every entry after it.

use crate::error::ModelError;
use crate::ids::{DocumentId, SignerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Something that happened to a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Distributed,
    LinkSent { signer: SignerId },
    Viewed { signer: SignerId },
    ChallengeIssued { signer: SignerId },
    Authenticated { signer: SignerId },
    AuthenticationFailed { signer: SignerId, attempts: u32 },
    FieldSigned {
        signer: SignerId,
        document: DocumentId,
        field: String,
    },
    Signed { signer: SignerId },
    Declined { signer: SignerId, expired: bool },
    Canceled,
    Completed,
    Finalized,
}

/// One link of the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: HistoryAction,
    /// E-mail, user id or "system"
    pub actor: String,
    pub previous_hash: Option<String>,
    pub details: Option<String>,
}

impl HistoryEvent {
    /// Hash of this event, used as the next event's `previous_hash`
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.event_id.as_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        // serde_json output is stable for these enums
        hasher.update(serde_json::to_vec(&self.action).unwrap_or_default());
        hasher.update(self.actor.as_bytes());
        if let Some(ref details) = self.details {
            hasher.update(details.as_bytes());
        }
        if let Some(ref prev) = self.previous_hash {
            hasher.update(prev.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Append-only, tamper-evident list of events
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryLog {
    pub events: Vec<HistoryEvent>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_hash(&self) -> Option<String> {
        self.events.last().map(HistoryEvent::compute_hash)
    }

    /// Append an event linked to the current tail
    pub fn append(
        &mut self,
        at: DateTime<Utc>,
        action: HistoryAction,
        actor: &str,
        details: Option<String>,
    ) {
        let event = HistoryEvent {
            event_id: Uuid::new_v4().to_string(),
            timestamp: at,
            action,
            actor: actor.to_string(),
            previous_hash: self.last_hash(),
            details,
        };
        self.events.push(event);
    }

    /// Check every link of the chain
    pub fn verify(&self) -> Result<(), ModelError> {
        let mut expected_prev: Option<String> = None;
        for (index, event) in self.events.iter().enumerate() {
            if event.previous_hash != expected_prev {
                return Err(ModelError::BrokenHistory { index });
            }
            expected_prev = Some(event.compute_hash());
        }
        Ok(())
    }

    /// Whether any event matches `predicate`
    pub fn contains(&self, predicate: impl Fn(&HistoryAction) -> bool) -> bool {
        self.events.iter().any(|e| predicate(&e.action))
    }

    /// One line per event, oldest first
    pub fn summary(&self) -> Vec<String> {
        self.events
            .iter()
            .map(|e| {
                format!(
                    "[{}] {} - {:?}",
                    e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    e.actor,
                    e.action
                )
            })
            .collect()
    }
}
