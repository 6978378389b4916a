//! Housekeeping jobs
//!
//! Each [`JobKind`] maps to one handler in a [`CleanupRegistry`]; running
//! a job is a table lookup, never a type check.

use crate::collaborators::Clock;
use crate::error::{Result, SigningError};
use crate::store::SplitProcessStore;
use crate::tokens::TokenIssuer;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobKind {
    /// Leftover per-operation scratch directories
    ScratchSweep,
    /// Revoked or expired signer tokens
    ExpiredTokens,
    /// Split-signature processes nobody resumed
    StaleSplitProcesses,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::ScratchSweep,
        JobKind::ExpiredTokens,
        JobKind::StaleSplitProcesses,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobReport {
    pub kind: JobKind,
    pub removed: usize,
}

pub trait CleanupHandler: Send + Sync {
    /// Remove whatever is stale at `now` and report how many items went
    fn run(&self, now: DateTime<Utc>) -> Result<usize>;
}

impl<F> CleanupHandler for F
where
    F: Fn(DateTime<Utc>) -> Result<usize> + Send + Sync,
{
    fn run(&self, now: DateTime<Utc>) -> Result<usize> {
        self(now)
    }
}

/// Removes scratch directories older than `max_age`
pub struct ScratchSweep {
    pub root: PathBuf,
    pub max_age: Duration,
}

impl CleanupHandler for ScratchSweep {
    fn run(&self, now: DateTime<Utc>) -> Result<usize> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SigningError::Storage(e.to_string())),
        };

        let cutoff = SystemTime::from(now - self.max_age);
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let modified = entry.metadata().and_then(|m| m.modified());
            if path.is_dir() && modified.is_ok_and(|m| m < cutoff) {
                fs::remove_dir_all(&path).map_err(|e| SigningError::Storage(e.to_string()))?;
                tracing::debug!("Removed stale scratch directory {}", path.display());
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Purges revoked and expired token mappings
pub struct ExpiredTokens {
    pub tokens: Arc<TokenIssuer>,
}

impl CleanupHandler for ExpiredTokens {
    fn run(&self, now: DateTime<Utc>) -> Result<usize> {
        self.tokens.purge_expired(now)
    }
}

/// Drops suspended processes untouched for `max_age`
pub struct StaleSplitProcesses {
    pub store: Arc<SplitProcessStore>,
    pub max_age: Duration,
}

impl CleanupHandler for StaleSplitProcesses {
    fn run(&self, now: DateTime<Utc>) -> Result<usize> {
        self.store.remove_older_than(now - self.max_age)
    }
}

pub struct CleanupRegistry {
    clock: Arc<dyn Clock>,
    handlers: BTreeMap<JobKind, Box<dyn CleanupHandler>>,
}

impl CleanupRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            handlers: BTreeMap::new(),
        }
    }

    /// Install `handler` for `kind`, replacing any previous one
    pub fn register(&mut self, kind: JobKind, handler: impl CleanupHandler + 'static) -> &mut Self {
        self.handlers.insert(kind, Box::new(handler));
        self
    }

    pub fn is_registered(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn run(&self, kind: JobKind) -> Result<JobReport> {
        let handler = self
            .handlers
            .get(&kind)
            .ok_or_else(|| SigningError::NotFound(format!("cleanup handler for {:?}", kind)))?;
        let removed = handler.run(self.clock.now())?;
        if removed > 0 {
            tracing::info!("Cleanup {:?} removed {} items", kind, removed);
        }
        Ok(JobReport { kind, removed })
    }

    /// Run every registered job in `JobKind` order
    pub fn run_all(&self) -> Result<Vec<JobReport>> {
        self.handlers.keys().map(|kind| self.run(*kind)).collect()
    }
}
