pub mod config;
pub mod error;
pub mod record;
pub mod queue;
pub mod store;
pub mod logger;
pub mod layer;

mod worker;

#[cfg(feature = "couchdb")]
pub mod couchdb;

pub mod env;
pub mod init;
pub mod memory_store;

pub use config::{DbConfig, IdlePolicy, LoggerConfig};
pub use error::{ConfigError, LoggerError, StoreError};
pub use logger::{Logger, ShutdownTrigger};
pub use record::{LogRecord, PersistedDocument};
pub use store::{Credentials, Identity, Store};
pub use worker::WorkerState;
