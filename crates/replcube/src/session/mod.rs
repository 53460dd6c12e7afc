//! Session registry
//!
//! Sessions live in a sharded concurrent map keyed by [`SessionId`]. Every
//! operation is a single atomic map access; unrelated sessions never contend
//! on a registry-wide lock. Executions against one session are serialized
//! through that session's gate (see [`SessionRegistry::lock`]).

use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::engine::{ContinuationToken, ResolvedReference};
use crate::types::ExternalReference;

/// Errors returned by registry operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session '{0}' not found; omit the session id to start a new session")]
    NotFound(String),
}

/// Opaque session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-visible view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionMetadata {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub execution_count: u64,
    pub is_initialized: bool,
    pub package_references: Vec<ExternalReference>,
}

/// What happened when references were merged into a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// References that were not already attached
    pub added: Vec<ExternalReference>,

    /// Continuation state was dropped to make room for the new references
    pub state_discarded: bool,
}

#[derive(Debug)]
struct SessionRecord {
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    execution_count: u64,
    is_initialized: bool,
    continuation: Option<ContinuationToken>,
    references: Vec<ResolvedReference>,
    gate: Arc<Mutex<()>>,
}

impl SessionRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            last_accessed_at: now,
            execution_count: 0,
            is_initialized: false,
            continuation: None,
            references: Vec::new(),
            gate: Arc::new(Mutex::new(())),
        }
    }

    fn metadata(&self, id: &SessionId) -> SessionMetadata {
        SessionMetadata {
            id: id.clone(),
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            execution_count: self.execution_count,
            is_initialized: self.is_initialized,
            package_references: self
                .references
                .iter()
                .map(|r| r.reference.clone())
                .collect(),
        }
    }
}

/// Exclusive right to run against one session's state
///
/// Held for the duration of an execution. Dropping it lets the next queued
/// request for the same session proceed.
#[derive(Debug)]
pub struct SessionGuard {
    id: SessionId,
    _guard: OwnedMutexGuard<()>,
}

impl SessionGuard {
    pub fn id(&self) -> &SessionId {
        &self.id
    }
}

/// Concurrent map of live sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionRecord>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty session and return its id
    #[instrument(skip(self))]
    pub fn create(&self) -> SessionId {
        loop {
            let id = SessionId::generate();
            // the entry API holds the shard lock, so check-and-insert is atomic
            if let Entry::Vacant(entry) = self.sessions.entry(id.clone()) {
                entry.insert(SessionRecord::new(Utc::now()));
                debug!(session = %id, "session created");
                return id;
            }
        }
    }

    /// Check whether `id` names a live session
    pub fn exists(&self, id: &str) -> bool {
        !id.trim().is_empty() && self.sessions.contains_key(id)
    }

    /// Current continuation token, refreshing the access time
    pub fn get_state(&self, id: &str) -> Result<Option<ContinuationToken>, SessionError> {
        let mut record = self.record_mut(id)?;
        record.last_accessed_at = Utc::now();
        Ok(record.continuation.clone())
    }

    /// Store the continuation produced by a successful state-persisting run
    #[instrument(skip(self, token))]
    pub fn update_state(&self, id: &str, token: ContinuationToken) -> Result<(), SessionError> {
        let mut record = self.record_mut(id)?;
        record.continuation = Some(token);
        record.execution_count += 1;
        record.is_initialized = true;
        record.last_accessed_at = Utc::now();
        debug!(execution_count = record.execution_count, "session state updated");
        Ok(())
    }

    /// Refresh the access time without changing state
    pub fn touch(&self, id: &str) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut record) => {
                record.last_accessed_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Remove a session, returning whether it existed
    #[instrument(skip(self))]
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            debug!("session removed");
        }
        removed
    }

    /// Remove every session, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, _| {
            removed += 1;
            false
        });
        info!(removed, "all sessions removed");
        removed
    }

    /// Remove sessions idle for longer than `ttl`
    pub fn sweep_expired(&self, ttl: Duration) -> usize {
        self.sweep_expired_at(Utc::now(), ttl)
    }

    /// Remove sessions whose idle time at `now` exceeds `ttl`
    pub fn sweep_expired_at(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut removed = 0;
        self.sessions.retain(|_, record| {
            let keep = now.signed_duration_since(record.last_accessed_at) <= ttl;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            info!(removed, remaining = self.sessions.len(), "expired sessions swept");
        }
        removed
    }

    /// Ids of all live sessions
    pub fn list_active(&self) -> HashSet<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn get_metadata(&self, id: &str) -> Option<SessionMetadata> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().metadata(entry.key()))
    }

    /// Metadata for every live session, oldest first
    pub fn list_metadata(&self) -> Vec<SessionMetadata> {
        let mut all: Vec<SessionMetadata> = self
            .sessions
            .iter()
            .map(|entry| entry.value().metadata(entry.key()))
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Resolved references attached to a session
    pub fn references(&self, id: &str) -> Result<Vec<ResolvedReference>, SessionError> {
        self.sessions
            .get(id)
            .map(|record| record.references.clone())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Attach references to a session
    ///
    /// The compiler cannot add references to an already-initialized state
    /// chain, so adding anything new to a session that holds continuation
    /// state drops that state. Already-attached references are skipped.
    #[instrument(skip(self, references))]
    pub fn merge_references(
        &self,
        id: &str,
        references: Vec<ResolvedReference>,
    ) -> Result<MergeOutcome, SessionError> {
        let mut record = self.record_mut(id)?;
        let mut outcome = MergeOutcome::default();

        for resolved in references {
            let present = record
                .references
                .iter()
                .any(|existing| existing.reference.same_as(&resolved.reference));
            if !present {
                outcome.added.push(resolved.reference.clone());
                record.references.push(resolved);
            }
        }

        if !outcome.added.is_empty() && record.continuation.is_some() {
            record.continuation = None;
            record.is_initialized = false;
            outcome.state_discarded = true;
        }
        record.last_accessed_at = Utc::now();

        debug!(
            added = outcome.added.len(),
            state_discarded = outcome.state_discarded,
            "references merged"
        );
        Ok(outcome)
    }

    /// Wait for exclusive access to a session's state
    pub async fn lock(&self, id: &str) -> Result<SessionGuard, SessionError> {
        // clone the gate out so no map shard stays locked across the await
        let (key, gate) = {
            let entry = self
                .sessions
                .get(id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            (entry.key().clone(), entry.value().gate.clone())
        };
        let guard = gate.lock_owned().await;
        Ok(SessionGuard {
            id: key,
            _guard: guard,
        })
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` until `cancel` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        ttl: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("session sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        registry.sweep_expired(ttl);
                    }
                }
            }
        })
    }

    fn record_mut(
        &self,
        id: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, SessionId, SessionRecord>, SessionError> {
        if id.trim().is_empty() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        self.sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }
}

/// Removes a single-shot session when dropped
///
/// Dropping happens on every exit path, including early returns and a
/// cancelled request future.
#[derive(Debug)]
pub struct EphemeralSession {
    registry: Arc<SessionRegistry>,
    id: SessionId,
}

impl EphemeralSession {
    pub fn create(registry: &Arc<SessionRegistry>) -> Self {
        Self {
            id: registry.create(),
            registry: Arc::clone(registry),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }
}

impl Drop for EphemeralSession {
    fn drop(&mut self) {
        self.registry.remove(self.id.as_str());
    }
}
