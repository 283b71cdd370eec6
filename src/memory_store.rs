use crate::error::StoreError;
use crate::record::PersistedDocument;
use crate::store::{Credentials, Identity, Store};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// In-process [`Store`] that keeps documents in memory.
///
/// Useful for local development and for tests that need to script store
/// failures: going offline, rejecting a number of saves, expiring or
/// revoking the session, or refusing credentials. Every attempted document id is
/// recorded, including the ones that failed.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    offline: bool,
    database_exists: bool,
    reject_create: bool,
    reject_auth: bool,
    failing_saves: usize,
    token: Option<String>,
    issued_at: Option<Instant>,
    session_ttl: Option<Duration>,
    revoked: bool,
    authentications: usize,
    attempts: Vec<String>,
    saved: Vec<PersistedDocument>,
}

impl MemoryStore {
    /// A reachable store whose database already exists and which has no
    /// session yet.
    pub fn new() -> Self {
        let store = MemoryStore::default();
        store.state.lock().database_exists = true;
        store
    }

    /// A reachable store with no database; `create_database` succeeds
    /// unless [`reject_database_creation`](Self::reject_database_creation)
    /// is set.
    pub fn without_database() -> Self {
        MemoryStore::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn reject_database_creation(&self, reject: bool) {
        self.state.lock().reject_create = reject;
    }

    pub fn reject_authentication(&self, reject: bool) {
        self.state.lock().reject_auth = reject;
    }

    /// Fail the next `n` saves with a transient error.
    pub fn fail_next_saves(&self, n: usize) {
        self.state.lock().failing_saves = n;
    }

    /// Drop the current session token.
    pub fn expire_session(&self) {
        self.state.lock().token = None;
    }

    /// Report sessions older than `ttl` as stale through
    /// [`has_auth_token`](Store::has_auth_token). Saves keep accepting the
    /// old token, like a server whose own expiry is longer.
    pub fn expire_sessions_after(&self, ttl: Duration) {
        self.state.lock().session_ttl = Some(ttl);
    }

    /// Invalidate the session on the store side only; the next save fails
    /// with [`StoreError::AuthExpired`] and drops the token.
    pub fn revoke_session(&self) {
        self.state.lock().revoked = true;
    }

    pub fn database_exists(&self) -> bool {
        self.state.lock().database_exists
    }

    pub fn authentications(&self) -> usize {
        self.state.lock().authentications
    }

    /// Ids of every save attempt, successful or not, in call order.
    pub fn attempted_ids(&self) -> Vec<String> {
        self.state.lock().attempts.clone()
    }

    /// Documents accepted so far, in the order they were saved.
    pub fn saved(&self) -> Vec<PersistedDocument> {
        self.state.lock().saved.clone()
    }

    pub fn saved_count(&self) -> usize {
        self.state.lock().saved.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn exists(&self) -> Result<bool, StoreError> {
        let state = self.state.lock();
        if state.offline {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(state.database_exists)
    }

    async fn create_database(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        if state.reject_create {
            return Err(StoreError::Unavailable("database creation refused".into()));
        }
        state.database_exists = true;
        Ok(())
    }

    async fn save(&self, document: &PersistedDocument) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.attempts.push(document.id.clone());

        if state.offline {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        if state.token.is_none() {
            return Err(StoreError::AuthExpired);
        }
        if state.revoked {
            state.revoked = false;
            state.token = None;
            return Err(StoreError::AuthExpired);
        }
        if state.failing_saves > 0 {
            state.failing_saves -= 1;
            return Err(StoreError::save_failed("injected save failure"));
        }

        state.saved.push(document.clone());
        Ok(())
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, StoreError> {
        let mut state = self.state.lock();
        state.authentications += 1;

        if state.offline {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        if state.reject_auth {
            state.token = None;
            return Err(StoreError::auth_failed("name or password is incorrect"));
        }

        state.token = Some(format!("session-{}", state.authentications));
        state.issued_at = Some(Instant::now());
        state.revoked = false;
        Ok(Identity {
            name: Some(credentials.name.clone()),
            roles: Vec::new(),
        })
    }

    fn has_auth_token(&self) -> bool {
        let state = self.state.lock();
        let fresh = match (state.session_ttl, state.issued_at) {
            (Some(ttl), Some(issued_at)) => issued_at.elapsed() < ttl,
            _ => true,
        };
        state.token.is_some() && fresh
    }
}
