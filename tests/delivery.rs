mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{eventually, record, seq_of, test_config, Harness, WAIT};
use couch_log_sink::memory_store::MemoryStore;
use couch_log_sink::record::{ID_PREFIX, REGISTRATION_TIMESTAMP};
use couch_log_sink::{Credentials, Identity, Logger, PersistedDocument, Store, StoreError, WorkerState};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Memory store whose first save panics inside the driver.
struct CrashOnFirstSave {
    inner: MemoryStore,
    saves: AtomicUsize,
}

#[async_trait]
impl Store for CrashOnFirstSave {
    async fn exists(&self) -> Result<bool, StoreError> {
        self.inner.exists().await
    }

    async fn create_database(&self) -> Result<(), StoreError> {
        self.inner.create_database().await
    }

    async fn save(&self, document: &PersistedDocument) -> Result<(), StoreError> {
        if self.saves.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("driver crashed mid-save");
        }
        self.inner.save(document).await
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Identity, StoreError> {
        self.inner.authenticate(credentials).await
    }

    fn has_auth_token(&self) -> bool {
        self.inner.has_auth_token()
    }
}

#[tokio::test]
async fn persists_records_with_fresh_ids_and_timestamps() {
    let h = Harness::new().await;
    let before = Utc::now();

    for seq in 0..5 {
        h.logger.create(record(seq));
    }
    assert!(eventually(|| h.store.saved_count() == 5).await);

    let saved = h.store.saved();
    let ids: HashSet<_> = saved.iter().map(|doc| doc.id.clone()).collect();
    assert_eq!(ids.len(), 5);

    for doc in &saved {
        assert!(doc.id.starts_with(ID_PREFIX));
        let stamped = doc.data.get(REGISTRATION_TIMESTAMP).and_then(Value::as_str).unwrap();
        let stamped = DateTime::parse_from_rfc3339(stamped).unwrap();
        assert!(stamped.timestamp_micros() >= before.timestamp_micros());
    }

    assert!(h.logger.shutdown(WAIT).await);
}

#[tokio::test]
async fn saves_in_fifo_order_without_failures() {
    let h = Harness::with(MemoryStore::new(), |config| config.auto_start = false).await;

    for seq in [1, 2, 3] {
        h.logger.create(record(seq));
    }
    h.logger.start(false).unwrap();
    assert!(eventually(|| h.store.saved_count() == 3).await);

    let order: Vec<_> = h.store.saved().iter().map(seq_of).collect();
    assert_eq!(order, vec![1, 2, 3]);

    assert!(h.logger.shutdown(WAIT).await);
}

#[tokio::test]
async fn transient_failures_retry_under_new_ids() {
    let h = Harness::new().await;
    h.store.fail_next_saves(3);

    h.logger.create(record(7));
    assert!(eventually(|| h.store.saved_count() == 1).await);

    let attempts = h.store.attempted_ids();
    assert_eq!(attempts.len(), 4);
    let unique: HashSet<_> = attempts.iter().collect();
    assert_eq!(unique.len(), 4);

    let saved = h.store.saved();
    assert_eq!(seq_of(&saved[0]), 7);
    assert_eq!(&saved[0].id, attempts.last().unwrap());

    assert!(h.logger.shutdown(WAIT).await);
    assert_eq!(h.store.saved_count(), 1);
}

#[tokio::test]
async fn revoked_session_is_renewed_and_record_retried() {
    let h = Harness::new().await;
    let logins = h.store.authentications();
    h.store.revoke_session();

    h.logger.create(record(1));
    assert!(eventually(|| h.store.saved_count() == 1).await);

    assert_eq!(h.store.authentications(), logins + 1);
    assert_eq!(h.store.attempted_ids().len(), 2);
    assert_eq!(seq_of(&h.store.saved()[0]), 1);

    assert!(h.logger.shutdown(WAIT).await);
}

#[tokio::test]
async fn stale_session_is_renewed_before_the_first_attempt() {
    let h = Harness::with(MemoryStore::new(), |_| {}).await;
    h.store.expire_sessions_after(Duration::from_millis(50));
    h.logger.create(record(1));
    assert!(eventually(|| h.store.saved_count() == 1).await);
    let logins = h.store.authentications();

    tokio::time::sleep(Duration::from_millis(80)).await;
    h.logger.create(record(2));
    assert!(eventually(|| h.store.saved_count() == 2).await);

    assert_eq!(h.store.authentications(), logins + 1);
    assert_eq!(h.store.attempted_ids().len(), 2);

    assert!(h.logger.shutdown(WAIT).await);
}

#[tokio::test]
async fn missing_session_is_renewed_without_a_failed_save() {
    let h = Harness::new().await;
    let logins = h.store.authentications();
    h.store.expire_session();

    h.logger.create(record(1));
    assert!(eventually(|| h.store.saved_count() == 1).await);

    assert_eq!(h.store.authentications(), logins + 1);
    assert_eq!(h.store.attempted_ids().len(), 1);

    assert!(h.logger.shutdown(WAIT).await);
}

#[tokio::test]
async fn failed_reauthentication_drops_record_without_retrying() {
    let h = Harness::new().await;
    let logins = h.store.authentications();
    h.store.revoke_session();
    h.store.reject_authentication(true);

    h.logger.create(record(1));
    assert!(eventually(|| h.store.attempted_ids().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.store.attempted_ids().len(), 1);
    assert_eq!(h.store.authentications(), logins + 1);
    assert_eq!(h.store.saved_count(), 0);
    assert_eq!(h.logger.pending(), 0);

    assert!(h.logger.shutdown(WAIT).await);
    assert!(h.dumped().is_empty());
}

#[tokio::test]
async fn offline_store_dumps_every_pending_record_once() {
    let h = Harness::with(MemoryStore::new(), |config| config.auto_start = false).await;
    h.store.set_offline(true);

    for seq in 0..10 {
        h.logger.create(record(seq));
    }
    h.logger.start(false).unwrap();
    h.logger.stop();
    h.logger.stopped().await;

    assert_eq!(h.store.saved_count(), 0);
    let mut seqs: Vec<_> = h.dumped().iter().map(seq_of).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (0..10).collect::<Vec<_>>());
    assert_eq!(h.logger.pending(), 0);
}

#[tokio::test]
async fn stop_right_after_enqueue_loses_nothing() {
    let h = Harness::with(MemoryStore::new(), |config| config.auto_start = false).await;

    for seq in 0..25 {
        h.logger.create(record(seq));
    }
    h.logger.start(false).unwrap();
    h.logger.stop();
    assert!(h.logger.shutdown(WAIT).await);

    let saved: Vec<_> = h.store.saved().iter().map(seq_of).collect();
    let dumped: Vec<_> = h.dumped().iter().map(seq_of).collect();

    let mut all: Vec<_> = saved.iter().chain(dumped.iter()).copied().collect();
    all.sort_unstable();
    assert_eq!(all, (0..25).collect::<Vec<_>>());
}

#[tokio::test]
async fn dump_stamps_documents_like_saves() {
    let h = Harness::with(MemoryStore::new(), |config| config.auto_start = false).await;
    h.store.set_offline(true);

    h.logger.create(record(1).with(REGISTRATION_TIMESTAMP, "stale"));
    h.logger.start(false).unwrap();
    assert!(h.logger.shutdown(WAIT).await);

    let dumped = h.dumped();
    assert_eq!(dumped.len(), 1);
    assert!(dumped[0].id.starts_with(ID_PREFIX));
    assert_ne!(dumped[0].data.get(REGISTRATION_TIMESTAMP), Some(&Value::from("stale")));
}

#[tokio::test]
async fn panicking_store_does_not_kill_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CrashOnFirstSave {
        inner: MemoryStore::new(),
        saves: AtomicUsize::new(0),
    });
    let logger = Logger::connect(test_config(dir.path()), store.clone()).await;

    logger.create(record(1));
    logger.create(record(2));
    assert!(eventually(|| store.inner.saved_count() == 1).await);

    assert_eq!(store.saves.load(Ordering::SeqCst), 2);
    assert_eq!(seq_of(&store.inner.saved()[0]), 2);
    assert_eq!(logger.state(), WorkerState { exiting: false, stopped: false });

    logger.create(record(3));
    assert!(eventually(|| store.inner.saved_count() == 2).await);
    assert!(logger.shutdown(WAIT).await);
}

#[tokio::test]
async fn unwritable_dump_still_stops_the_worker() {
    let h = Harness::with(MemoryStore::new(), |config| {
        config.auto_start = false;
        config.dump_path = config.dump_path.with_file_name("missing").join("uncommited_logs");
    })
    .await;
    h.store.set_offline(true);

    for seq in 0..3 {
        h.logger.create(record(seq));
    }
    h.logger.start(false).unwrap();

    assert!(h.logger.shutdown(WAIT).await);
    assert_eq!(h.logger.state(), WorkerState { exiting: false, stopped: true });
    assert!(!h.dir.path().join("missing").exists());
    assert_eq!(h.logger.pending(), 0);
}
