use crate::config::{DbConfig, LoggerConfig};
use crate::error::StoreError;
use crate::record::PersistedDocument;
use crate::store::{Credentials, Identity, Store};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, COOKIE, SET_COOKIE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};

const SESSION_COOKIE: &str = "AuthSession";

/// Session settings for [`CouchStore`].
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Age after which the cookie is treated as expired locally.
    pub session_timeout: Duration,
    /// Keep idle HTTP connections open between requests.
    pub keep_alive: bool,
}

impl From<&LoggerConfig> for SessionOptions {
    fn from(config: &LoggerConfig) -> Self {
        SessionOptions {
            session_timeout: config.session_timeout,
            keep_alive: config.keep_alive,
        }
    }
}

#[derive(Default)]
struct Session {
    token: Option<String>,
    issued_at: Option<Instant>,
}

/// CouchDB implementation of [`Store`] using the HTTP document API and
/// cookie authentication.
pub struct CouchStore {
    client: Client,
    base_url: String,
    database: String,
    options: SessionOptions,
    session: Mutex<Session>,
}

impl CouchStore {
    /// Build a store for the database described by `db`.
    ///
    /// No request is sent here; the session is opened by the first
    /// [`authenticate`](Store::authenticate) call.
    pub fn new(db: &DbConfig, options: SessionOptions) -> Result<Self, StoreError> {
        let mut builder = Client::builder();
        builder = if options.keep_alive {
            builder.tcp_keepalive(Duration::from_secs(60))
        } else {
            builder.pool_max_idle_per_host(0)
        };

        Ok(Self {
            client: builder.build()?,
            base_url: db.base_url(),
            database: db.name.clone(),
            options,
            session: Mutex::new(Session::default()),
        })
    }

    /// Factory matching [`Logger::connect_with`](crate::logger::Logger::connect_with).
    pub fn from_config(config: &LoggerConfig) -> Result<Self, StoreError> {
        Self::new(&config.db, SessionOptions::from(config))
    }

    fn database_url(&self) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(&self.database))
    }

    fn session_url(&self) -> String {
        format!("{}/_session", self.base_url)
    }

    fn with_session(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.session.lock().token {
            Some(token) => request.header(COOKIE, format!("{}={}", SESSION_COOKIE, token)),
            None => request,
        }
    }

    fn clear_session(&self) {
        *self.session.lock() = Session::default();
    }

    /// Map a 401 onto an expired session, dropping the stale token.
    fn check_auth(&self, status: StatusCode) -> Result<(), StoreError> {
        if status == StatusCode::UNAUTHORIZED {
            self.clear_session();
            return Err(StoreError::AuthExpired);
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct CouchErrorBody {
    error: Option<String>,
    reason: Option<String>,
}

/// Render a failed response as `status: error (reason)`.
async fn failure_reason(resp: Response) -> String {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
    match serde_json::from_str::<CouchErrorBody>(&text) {
        Ok(CouchErrorBody { error: Some(error), reason: Some(reason) }) => {
            format!("{}: {} ({})", status, error, reason)
        }
        Ok(CouchErrorBody { error: Some(error), reason: None }) => format!("{}: {}", status, error),
        _ => format!("{}: {}", status, text),
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

#[async_trait]
impl Store for CouchStore {
    async fn exists(&self) -> Result<bool, StoreError> {
        let resp = self.with_session(self.client.head(self.database_url())).send().await?;
        let status = resp.status();
        self.check_auth(status)?;

        match status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(StoreError::Unavailable(failure_reason(resp).await)),
        }
    }

    async fn create_database(&self) -> Result<(), StoreError> {
        let resp = self.with_session(self.client.put(self.database_url())).send().await?;
        let status = resp.status();
        self.check_auth(status)?;

        // 412: someone else created it in the meantime.
        if status.is_success() || status == StatusCode::PRECONDITION_FAILED {
            Ok(())
        } else {
            Err(StoreError::Unavailable(failure_reason(resp).await))
        }
    }

    async fn save(&self, document: &PersistedDocument) -> Result<(), StoreError> {
        let resp = self
            .with_session(self.client.post(self.database_url()))
            .json(document)
            .send()
            .await?;
        let status = resp.status();
        self.check_auth(status)?;

        if status.is_success() {
            Ok(())
        } else {
            Err(StoreError::save_failed(failure_reason(resp).await))
        }
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, StoreError> {
        let resp = self.client.post(self.session_url()).json(credentials).send().await?;
        let status = resp.status();

        if !status.is_success() {
            self.clear_session();
            return Err(StoreError::auth_failed(failure_reason(resp).await));
        }

        let token = session_cookie(resp.headers());
        let identity: Identity = resp.json().await?;

        match token {
            Some(token) => {
                *self.session.lock() = Session {
                    token: Some(token),
                    issued_at: Some(Instant::now()),
                };
                Ok(identity)
            }
            None => {
                self.clear_session();
                Err(StoreError::auth_failed("server did not issue a session cookie"))
            }
        }
    }

    fn has_auth_token(&self) -> bool {
        let session = self.session.lock();
        match (&session.token, session.issued_at) {
            (Some(token), Some(issued_at)) => {
                !token.is_empty() && issued_at.elapsed() < self.options.session_timeout
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn store() -> CouchStore {
        let db = DbConfig {
            name: "app/logs".to_string(),
            ..DbConfig::default()
        };
        CouchStore::new(
            &db,
            SessionOptions {
                session_timeout: Duration::from_millis(50),
                keep_alive: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn urls_encode_database_name() {
        let store = store();
        assert_eq!(store.database_url(), "http://127.0.0.1:5984/app%2Flogs");
        assert_eq!(store.session_url(), "http://127.0.0.1:5984/_session");
    }

    #[test]
    fn extracts_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("other=1; Path=/"));
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("AuthSession=bG9nZ2VyOjY1; Version=1; Path=/; HttpOnly"),
        );
        assert_eq!(session_cookie(&headers).as_deref(), Some("bG9nZ2VyOjY1"));

        let mut empty = HeaderMap::new();
        empty.append(SET_COOKIE, HeaderValue::from_static("AuthSession=; Path=/"));
        assert_eq!(session_cookie(&empty), None);
    }

    #[test]
    fn session_expires_locally() {
        let store = store();
        assert!(!store.has_auth_token());

        *store.session.lock() = Session {
            token: Some("abc".into()),
            issued_at: Some(Instant::now()),
        };
        assert!(store.has_auth_token());

        std::thread::sleep(Duration::from_millis(60));
        assert!(!store.has_auth_token());
    }

    #[test]
    fn unauthorized_clears_token() {
        let store = store();
        *store.session.lock() = Session {
            token: Some("abc".into()),
            issued_at: Some(Instant::now()),
        };

        assert!(matches!(store.check_auth(StatusCode::UNAUTHORIZED), Err(StoreError::AuthExpired)));
        assert!(!store.has_auth_token());
        assert!(store.check_auth(StatusCode::CREATED).is_ok());
    }
}
