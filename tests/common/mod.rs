#![allow(dead_code)]

use couch_log_sink::memory_store::MemoryStore;
use couch_log_sink::{LogRecord, Logger, LoggerConfig, PersistedDocument};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const WAIT: Duration = Duration::from_secs(5);

/// Logger tuned for tests: short polls, near-instant retries and a dump
/// file inside a private temp directory.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub logger: Logger,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(MemoryStore::new(), |_| {}).await
    }

    pub async fn with(store: MemoryStore, tweak: impl FnOnce(&mut LoggerConfig)) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut config = test_config(dir.path());
        tweak(&mut config);

        let store = Arc::new(store);
        let logger = Logger::connect(config, store.clone()).await;
        Harness { store, logger, dir }
    }

    pub fn dump_path(&self) -> PathBuf {
        dump_path(self.dir.path())
    }

    pub fn dumped(&self) -> Vec<PersistedDocument> {
        read_dump(&self.dump_path())
    }
}

pub fn test_config(dir: &Path) -> LoggerConfig {
    LoggerConfig {
        poll_timeout: Duration::from_millis(25),
        retry_backoff: Duration::from_millis(1),
        max_retry_backoff: Duration::from_millis(5),
        dump_path: dump_path(dir),
        ..LoggerConfig::default()
    }
}

pub fn dump_path(dir: &Path) -> PathBuf {
    dir.join("uncommited_logs")
}

pub fn read_dump(path: &Path) -> Vec<PersistedDocument> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).expect("dump file is a JSON array of documents"),
        Err(_) => Vec::new(),
    }
}

pub fn record(seq: u64) -> LogRecord {
    LogRecord::new().with("seq", seq).with("event", "test")
}

pub fn seq_of(doc: &PersistedDocument) -> u64 {
    doc.data.get("seq").and_then(Value::as_u64).expect("record has a seq field")
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
