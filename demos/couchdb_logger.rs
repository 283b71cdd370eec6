use std::time::Duration;

use couch_log_sink::env::{db_config_from_env, env_or, COUCH_LOG_DUMP_PATH_ENV};
use couch_log_sink::init::init_tracing;
use couch_log_sink::{LogRecord, Logger, LoggerConfig};
use tracing::{error, info};

/// Ships `error!` events and hand-built records to the CouchDB server
/// configured through `COUCH_LOG_DSN` (or the `COUCH_LOG_DB_*` variables)
/// until Ctrl-C is pressed.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = LoggerConfig::new(db_config_from_env()?);
    config.dump_path = env_or(COUCH_LOG_DUMP_PATH_ENV, "../uncommited_logs").into();

    let logger = Logger::connect_couchdb(config).await;
    if let Some(err) = logger.failure() {
        eprintln!("logging disabled: {}", err);
        return Ok(());
    }

    init_tracing(logger.clone())?;
    logger.start(false)?;

    let trigger = logger.shutdown_trigger();
    {
        let trigger = trigger.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                trigger.fire();
            }
        });
    }

    info!("couchdb logger demo started, press Ctrl-C to exit");
    let mut tick: u64 = 0;
    loop {
        tick += 1;
        logger.create(LogRecord::new().with("event", "heartbeat").with("tick", tick));
        if tick % 5 == 0 {
            error!(tick, reason = "simulated failure", "background job failed");
        }

        tokio::select! {
            _ = trigger.fired() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }

    // A heartbeat racing the interrupt may have restarted the worker.
    logger.stop();
    logger.stopped().await;
    Ok(())
}
