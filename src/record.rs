use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Field the worker stamps onto every record right before persistence.
pub const REGISTRATION_TIMESTAMP: &str = "registrationTimestamp";

/// Namespace prefix of every document id minted by this crate.
pub const ID_PREFIX: &str = "log_2_";

/// A caller-supplied log event: an insertion-ordered mapping of field
/// names to arbitrary JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogRecord(Map<String, Value>);

impl LogRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for assembling records inline.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Overwrite `registrationTimestamp` with the current UTC instant.
    pub fn stamp(&mut self) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        self.0.insert(REGISTRATION_TIMESTAMP.to_string(), Value::String(now));
    }
}

impl From<Map<String, Value>> for LogRecord {
    fn from(fields: Map<String, Value>) -> Self {
        LogRecord(fields)
    }
}

impl TryFrom<Value> for LogRecord {
    type Error = Value;

    /// Only JSON objects are records; any other value is handed back.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(LogRecord(fields)),
            other => Err(other),
        }
    }
}

/// The stored form of a [`LogRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub data: LogRecord,
}

impl PersistedDocument {
    /// Wrap `record` under a freshly minted id and stamp it.
    ///
    /// Every call produces a new id, so a retried record never reuses the
    /// id of an earlier attempt.
    pub fn new(mut record: LogRecord) -> Self {
        record.stamp();
        PersistedDocument {
            id: mint_id(),
            data: record,
        }
    }
}

fn mint_id() -> String {
    format!("{}{}", ID_PREFIX, Uuid::new_v4().to_string().to_uppercase())
}
