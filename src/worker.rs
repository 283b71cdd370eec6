use crate::config::{IdlePolicy, LoggerConfig};
use crate::error::{LoggerError, StoreError};
use crate::queue::{Empty, EventQueue};
use crate::record::{LogRecord, PersistedDocument};
use crate::store::{Credentials, Store};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observable lifecycle of the worker.
///
/// `exiting` is raised by a stop request; `stopped` is raised only by the
/// worker once it has drained, at which point it also clears `exiting` so
/// a later `start()` can run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerState {
    pub exiting: bool,
    pub stopped: bool,
}

impl WorkerState {
    pub(crate) const RUNNING: WorkerState = WorkerState { exiting: false, stopped: false };
    pub(crate) const STOPPED: WorkerState = WorkerState { exiting: false, stopped: true };
    pub(crate) const INERT: WorkerState = WorkerState { exiting: true, stopped: true };
}

/// Queue entry: a producer's record, or the marker that bounds the
/// shutdown drain.
pub(crate) enum Pending {
    Record(LogRecord),
    Sentinel,
}

/// Worker tunables, clamped to avoid degenerate configurations.
#[derive(Clone, Debug)]
pub(crate) struct WorkerSettings {
    pub poll_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub dump_path: PathBuf,
    pub idle_policy: IdlePolicy,
}

impl From<&LoggerConfig> for WorkerSettings {
    fn from(config: &LoggerConfig) -> Self {
        let poll_timeout = config.poll_timeout.max(Duration::from_millis(10));
        let retry_backoff = config.retry_backoff.max(Duration::from_millis(1));
        WorkerSettings {
            poll_timeout,
            retry_backoff,
            max_retry_backoff: config.max_retry_backoff.max(retry_backoff),
            dump_path: config.dump_path.clone(),
            idle_policy: config.idle_policy,
        }
    }
}

/// Everything the worker thread shares with the owning logger.
pub(crate) struct Shared {
    pub queue: EventQueue<Pending>,
    pub store: Arc<dyn Store>,
    pub credentials: Credentials,
    pub settings: WorkerSettings,
    pub state: watch::Sender<WorkerState>,
    /// Set once this logger has written the fallback file; later drains
    /// extend it instead of replacing it.
    pub dumped: AtomicBool,
}

impl Shared {
    pub fn request_exit(&self) {
        self.state.send_modify(|state| state.exiting = true);
    }
}

enum Delivery {
    Persisted,
    Requeued,
    Dropped,
}

enum Renewal {
    Renewed,
    Refused,
    Unreachable(StoreError),
}

/// Pause after failed saves, doubling up to a ceiling.
struct Backoff {
    initial: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Backoff { initial, current: initial, max }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Body of one worker run: deliver until `exit` fires, then drain.
pub(crate) async fn run(shared: Arc<Shared>, exit: CancellationToken) {
    info!("logging worker started");
    let settings = &shared.settings;
    let mut backoff = Backoff::new(settings.retry_backoff, settings.max_retry_backoff);

    while !exit.is_cancelled() {
        let entry = tokio::select! {
            biased;
            _ = exit.cancelled() => break,
            entry = shared.queue.dequeue(settings.poll_timeout) => entry,
        };

        let record = match entry {
            Ok(Pending::Record(record)) => record,
            Ok(Pending::Sentinel) => {
                shared.queue.mark_done();
                continue;
            }
            Err(Empty) => {
                if settings.idle_policy == IdlePolicy::StopWhenIdle {
                    debug!("queue idle, logging worker stopping itself");
                    shared.request_exit();
                    exit.cancel();
                }
                continue;
            }
        };

        let outcome = AssertUnwindSafe(deliver(&shared, record)).catch_unwind().await;
        shared.queue.mark_done();

        match outcome {
            Ok(Delivery::Persisted) => backoff.reset(),
            Ok(Delivery::Requeued) | Ok(Delivery::Dropped) => pause(backoff.next(), &exit).await,
            Err(panic) => {
                let fault = LoggerError::UnexpectedFault(panic_message(panic.as_ref()));
                error!(error = %fault, "log record lost");
            }
        }
    }

    info!("signal to abort logging received; logging worker is exiting");
    drain(&shared).await;

    shared.state.send_replace(WorkerState::STOPPED);
    info!("logging worker has exited");
}

/// Stamp and save one record, deciding what happens to it on failure.
async fn deliver(shared: &Shared, record: LogRecord) -> Delivery {
    if !shared.store.has_auth_token() {
        debug!("logging session is stale, renewing it before saving");
        match renew_session(shared).await {
            Renewal::Renewed => {}
            Renewal::Refused => return Delivery::Dropped,
            Renewal::Unreachable(err) => {
                warn!(error = %err, "could not renew logging session");
                return requeue(shared, record);
            }
        }
    }

    let document = PersistedDocument::new(record.clone());

    let err = match shared.store.save(&document).await {
        Ok(()) => {
            debug!(id = %document.id, "log record persisted");
            return Delivery::Persisted;
        }
        Err(err) => err,
    };

    warn!(id = %document.id, error = %err, "saving log record failed");

    if err.is_auth_expired() || !shared.store.has_auth_token() {
        warn!("logging session has expired, re-authenticating");
        match renew_session(shared).await {
            Renewal::Renewed => {}
            Renewal::Refused => return Delivery::Dropped,
            Renewal::Unreachable(auth_err) => {
                error!(error = %auth_err, "re-authentication failed; dropping log record");
                return Delivery::Dropped;
            }
        }
    }

    requeue(shared, record)
}

/// Open a new session. Rejected credentials and anonymous sessions are
/// `Refused`; anything else leaves the outcome open.
async fn renew_session(shared: &Shared) -> Renewal {
    match shared.store.authenticate(&shared.credentials).await {
        Ok(identity) if identity.is_named() => Renewal::Renewed,
        Ok(_) => {
            error!("store returned an anonymous session; dropping log record");
            Renewal::Refused
        }
        Err(err @ StoreError::AuthFailed { .. }) => {
            error!(error = %err, "re-authentication failed; dropping log record");
            Renewal::Refused
        }
        Err(err) => Renewal::Unreachable(err),
    }
}

fn requeue(shared: &Shared, record: LogRecord) -> Delivery {
    shared.queue.enqueue(Pending::Record(record));
    info!(pending = shared.queue.len(), "log record requeued for submission");
    Delivery::Requeued
}

async fn pause(delay: Duration, exit: &CancellationToken) {
    tokio::select! {
        _ = sleep(delay) => {}
        _ = exit.cancelled() => {}
    }
}

/// Move everything still queued into the fallback file.
async fn drain(shared: &Shared) {
    if shared.queue.is_empty() {
        return;
    }

    info!("dumping uncommitted log events to disk");
    shared.queue.enqueue(Pending::Sentinel);

    let mut documents = Vec::new();
    loop {
        match shared.queue.dequeue(shared.settings.poll_timeout).await {
            Ok(Pending::Record(record)) => documents.push(PersistedDocument::new(record)),
            Ok(Pending::Sentinel) => {
                shared.queue.mark_done();
                break;
            }
            Err(Empty) => {
                warn!("drain sentinel never arrived; dumping what was collected");
                break;
            }
        }
        shared.queue.mark_done();
    }

    if documents.is_empty() {
        return;
    }

    let count = documents.len();
    let path = &shared.settings.dump_path;
    match extend_dump(shared, documents).await {
        Ok(total) => info!(count, total, path = %path.display(), "uncommitted log events written"),
        Err(err) => error!(count, error = %err, "uncommitted log events lost"),
    }
}

/// Write `documents` to the fallback file, keeping whatever an earlier
/// drain of this logger put there. Returns the number of documents on disk.
async fn extend_dump(shared: &Shared, documents: Vec<PersistedDocument>) -> Result<usize, LoggerError> {
    let path = &shared.settings.dump_path;
    let mut all = Vec::new();
    if shared.dumped.load(Ordering::Acquire) {
        match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<PersistedDocument>>(&bytes) {
                Ok(previous) => all = previous,
                Err(err) => warn!(error = %err, "previous dump unreadable, replacing it"),
            },
            Err(err) => warn!(error = %err, "previous dump missing, replacing it"),
        }
    }
    all.extend(documents);

    write_dump(path, &all).await?;
    shared.dumped.store(true, Ordering::Release);
    Ok(all.len())
}

/// Overwrite `path` with `documents` encoded as one JSON array.
pub(crate) async fn write_dump(path: &Path, documents: &[PersistedDocument]) -> Result<(), LoggerError> {
    let encoded = serde_json::to_vec(documents)?;
    tokio::fs::write(path, encoded).await.map_err(|source| LoggerError::Dump {
        path: path.to_path_buf(),
        source,
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
