use crate::config::LoggerConfig;
use crate::error::{LoggerError, StoreError};
use crate::queue::EventQueue;
use crate::record::LogRecord;
use crate::store::{Disconnected, Store};
use crate::worker::{self, Pending, Shared, WorkerSettings, WorkerState};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Queue-backed logger that persists records to a [`Store`] from a single
/// background worker thread.
///
/// `Logger` is a cheap handle; clones share the same queue and worker.
/// Producers call [`create`](Self::create) and never block. The worker
/// stamps each record with an id and `registrationTimestamp`, saves it,
/// requeues it on transient failure and, once asked to stop, writes
/// whatever is still queued to the configured fallback file.
///
/// When the last handle is dropped, a non-daemon worker is asked to stop
/// and joined. Records still queued after its drain, such as ones created
/// while it was draining, are written to the fallback file before the drop
/// returns.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerHandle>>,
    failure: Option<LoggerError>,
    auto_start: bool,
    interrupt: CancellationToken,
}

struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    exit: CancellationToken,
    daemon: bool,
}

impl WorkerHandle {
    fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |thread| thread.is_finished())
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("logging worker thread panicked");
            }
        }
    }
}

impl Logger {
    /// Open a logging session on `store` and prepare the database.
    ///
    /// Authenticates with the configured credentials unless the store
    /// already holds a session, then creates the database if it is missing.
    /// Any failure leaves the logger inert: its state is
    /// `{ exiting: true, stopped: true }`, it never starts a worker and
    /// [`failure`](Self::failure) reports why.
    pub async fn connect(config: LoggerConfig, store: Arc<dyn Store>) -> Self {
        let failure = match open_store(&config, store.as_ref()).await {
            Ok(()) => None,
            Err(err) => {
                error!(error = %err, "the logging database connection failed");
                Some(LoggerError::StoreUnavailable(err))
            }
        };
        Self::assemble(&config, store, failure)
    }

    /// Like [`connect`](Self::connect), building the store from `config`
    /// with `factory` first.
    pub async fn connect_with<F, S>(config: LoggerConfig, factory: F) -> Self
    where
        F: FnOnce(&LoggerConfig) -> Result<S, StoreError>,
        S: Store + 'static,
    {
        match factory(&config) {
            Ok(store) => Self::connect(config, Arc::new(store)).await,
            Err(err) => {
                error!(error = %err, "could not build the logging store client");
                Self::assemble(&config, Arc::new(Disconnected), Some(LoggerError::StoreUnavailable(err)))
            }
        }
    }

    /// Connect to the CouchDB server described by `config.db`.
    #[cfg(feature = "couchdb")]
    pub async fn connect_couchdb(config: LoggerConfig) -> Self {
        Self::connect_with(config, crate::couchdb::CouchStore::from_config).await
    }

    fn assemble(config: &LoggerConfig, store: Arc<dyn Store>, failure: Option<LoggerError>) -> Self {
        let initial = if failure.is_some() {
            WorkerState::INERT
        } else {
            WorkerState::default()
        };
        let (state, _) = watch::channel(initial);

        let shared = Arc::new(Shared {
            queue: EventQueue::new(),
            store,
            credentials: config.db.credentials(),
            settings: WorkerSettings::from(config),
            state,
            dumped: AtomicBool::new(false),
        });

        Logger {
            inner: Arc::new(LoggerInner {
                shared,
                worker: Mutex::new(None),
                failure,
                auto_start: config.auto_start,
                interrupt: CancellationToken::new(),
            }),
        }
    }

    /// Start the worker unless one is already running.
    ///
    /// A worker that has finished its drain is replaced by a fresh one; a
    /// worker that is still draining is left alone. `daemon` workers are
    /// detached instead of joined when the logger is dropped.
    pub fn start(&self, daemon: bool) -> Result<(), LoggerError> {
        self.inner.start(daemon)
    }

    /// Ask the worker to exit. Returns immediately; wait on
    /// [`stopped`](Self::stopped) to observe the end of the drain.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Queue `record` for eventual persistence.
    ///
    /// Fire-and-forget: nothing reports whether the record was saved. With
    /// `auto_start` enabled this also (re)starts the worker. An inert logger
    /// discards the record.
    pub fn create(&self, record: LogRecord) {
        let inner = &self.inner;
        if inner.failure.is_some() {
            warn!("logger is inert; discarding log record");
            return;
        }

        inner.shared.queue.enqueue(Pending::Record(record));
        if inner.auto_start {
            if let Err(err) = inner.start(false) {
                error!(error = %err, "could not start logging worker");
            }
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.shared.state.borrow()
    }

    /// Resolves once the worker has drained and stopped. Returns at once if
    /// no worker was ever started.
    pub async fn stopped(&self) {
        let mut state = self.inner.shared.state.subscribe();
        let never_started = self.inner.worker.lock().is_none();
        if never_started {
            return;
        }
        let _ = state.wait_for(|state| state.stopped).await;
    }

    /// Stop the worker and wait up to `timeout` for its drain.
    ///
    /// Returns `false` if the worker was still draining when the timeout
    /// elapsed.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.stop();
        tokio::time::timeout(timeout, self.stopped()).await.is_ok()
    }

    /// Handle the host application can wire into its own interrupt
    /// handling. It does not keep the logger alive.
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            inner: Arc::downgrade(&self.inner),
            fired: self.inner.interrupt.clone(),
        }
    }

    pub fn is_inert(&self) -> bool {
        self.inner.failure.is_some()
    }

    /// Why construction failed, for an inert logger.
    pub fn failure(&self) -> Option<&LoggerError> {
        self.inner.failure.as_ref()
    }

    /// Records waiting in the queue; a snapshot.
    pub fn pending(&self) -> usize {
        self.inner.shared.queue.len()
    }
}

impl LoggerInner {
    fn start(&self, daemon: bool) -> Result<(), LoggerError> {
        if self.failure.is_some() {
            debug!("logger is inert; not starting worker");
            return Ok(());
        }

        let mut slot = self.worker.lock();
        if let Some(handle) = slot.as_mut() {
            // `stopped` is published right before the thread exits.
            let drained = self.shared.state.borrow().stopped;
            if !drained && !handle.is_finished() {
                return Ok(());
            }
            handle.join();
        }

        let exit = CancellationToken::new();
        self.shared.state.send_replace(WorkerState::RUNNING);
        let thread = match spawn_worker(Arc::clone(&self.shared), exit.clone()) {
            Ok(thread) => thread,
            Err(err) => {
                self.shared.state.send_replace(WorkerState::STOPPED);
                return Err(LoggerError::Spawn(err));
            }
        };

        *slot = Some(WorkerHandle {
            thread: Some(thread),
            exit,
            daemon,
        });
        info!(daemon, "logging thread has started");
        Ok(())
    }

    fn stop(&self) {
        let slot = self.worker.lock();
        if let Some(handle) = slot.as_ref() {
            if !handle.exit.is_cancelled() {
                info!("signalling logging thread to exit");
                self.shared.request_exit();
                handle.exit.cancel();
            }
        }
    }
}

impl Drop for LoggerInner {
    fn drop(&mut self) {
        if let Some(mut handle) = self.worker.get_mut().take() {
            if handle.daemon {
                return;
            }

            if !handle.exit.is_cancelled() {
                self.shared.request_exit();
                handle.exit.cancel();
            }
            if !handle.is_finished() {
                info!("waiting for logging thread to drain");
            }
            handle.join();
        }

        // No handle is left to enqueue, so one more drain empties the queue.
        if self.failure.is_none() && !self.shared.queue.is_empty() {
            info!(pending = self.shared.queue.len(), "draining log records left in the queue");
            let exit = CancellationToken::new();
            exit.cancel();
            match spawn_worker(Arc::clone(&self.shared), exit) {
                Ok(thread) => {
                    if thread.join().is_err() {
                        error!("logging worker thread panicked");
                    }
                }
                Err(err) => error!(error = %err, "could not spawn final drain; log records lost"),
            }
        }
    }
}

/// Weak handle that stops a [`Logger`]'s worker from outside, typically
/// from the host's Ctrl-C handler.
///
/// All triggers of one logger share a single latch: once any of them has
/// fired, [`fired`](Self::fired) resolves for every clone, even after the
/// worker has restarted.
#[derive(Clone)]
pub struct ShutdownTrigger {
    inner: Weak<LoggerInner>,
    fired: CancellationToken,
}

impl ShutdownTrigger {
    /// Request the worker to exit; the stop is a no-op once the logger is
    /// gone.
    pub fn fire(&self) {
        self.fired.cancel();
        if let Some(inner) = self.inner.upgrade() {
            inner.stop();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired.is_cancelled()
    }

    /// Resolves once [`fire`](Self::fire) has been called on any trigger of
    /// the same logger.
    pub async fn fired(&self) {
        self.fired.cancelled().await;
    }
}

async fn open_store(config: &LoggerConfig, store: &dyn Store) -> Result<(), StoreError> {
    if !store.has_auth_token() {
        let identity = store.authenticate(&config.db.credentials()).await?;
        debug!(name = ?identity.name, "logging session established");
    }
    if !store.has_auth_token() {
        return Err(StoreError::AuthExpired);
    }

    if !store.exists().await? {
        info!(
            database = %config.db.name,
            "logging database does not exist, attempting to create it now"
        );
        store.create_database().await?;
    }
    Ok(())
}

fn spawn_worker(shared: Arc<Shared>, exit: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("couch-log-worker".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!(error = %err, "failed to build logging worker runtime");
                    shared.state.send_replace(WorkerState::STOPPED);
                    return;
                }
            };

            let run = AssertUnwindSafe(|| runtime.block_on(worker::run(Arc::clone(&shared), exit)));
            if panic::catch_unwind(run).is_err() {
                error!("logging worker aborted");
                shared.state.send_replace(WorkerState::STOPPED);
            }
        })
}
