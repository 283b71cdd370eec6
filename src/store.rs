use crate::error::StoreError;
use crate::record::PersistedDocument;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Credential pair used to open (and re-open) a store session.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub name: String,
    pub password: String,
}

impl Credentials {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            name: name.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Session identity returned by a successful authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Identity {
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Identity {
    /// An identity only counts when the store named the session owner.
    pub fn is_named(&self) -> bool {
        self.name.as_deref().is_some_and(|name| !name.is_empty())
    }
}

/// Remote document store the logging worker persists into.
///
/// After construction only the worker calls into the store, so
/// implementations need interior mutability for their session state but
/// no coordination between concurrent callers beyond `Send + Sync`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Whether the target database exists.
    async fn exists(&self) -> Result<bool, StoreError>;

    /// Create the target database.
    async fn create_database(&self) -> Result<(), StoreError>;

    /// Persist a single document.
    ///
    /// **Returns**
    /// - `Ok(())` once the store accepted the document.
    /// - `Err(StoreError::AuthExpired)` when the session is no longer valid;
    ///   the worker re-authenticates and retries the record.
    /// - any other `Err(..)` is treated as transient and the record is
    ///   requeued.
    async fn save(&self, document: &PersistedDocument) -> Result<(), StoreError>;

    /// Open a new session with `credentials`.
    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, StoreError>;

    /// Whether the current session holds a token that is still usable.
    fn has_auth_token(&self) -> bool;
}

/// Placeholder store for a logger whose real store could not be built.
pub(crate) struct Disconnected;

#[async_trait]
impl Store for Disconnected {
    async fn exists(&self) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("store was never connected".into()))
    }

    async fn create_database(&self) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("store was never connected".into()))
    }

    async fn save(&self, _document: &PersistedDocument) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("store was never connected".into()))
    }

    async fn authenticate(&self, _credentials: &Credentials) -> Result<Identity, StoreError> {
        Err(StoreError::Unavailable("store was never connected".into()))
    }

    fn has_auth_token(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_requires_non_empty_name() {
        assert!(!Identity::default().is_named());
        assert!(!Identity { name: Some(String::new()), roles: vec![] }.is_named());
        assert!(Identity { name: Some("logger".into()), roles: vec![] }.is_named());
    }

    #[test]
    fn credentials_debug_hides_password() {
        let rendered = format!("{:?}", Credentials::new("logger", "hunter2"));
        assert!(rendered.contains("logger"));
        assert!(!rendered.contains("hunter2"));
    }
}
