use std::sync::Arc;
use std::time::{Duration, Instant};

use couch_log_sink::memory_store::MemoryStore;
use couch_log_sink::{LogRecord, Logger, LoggerConfig};

#[tokio::main]
async fn main() {
    let store = Arc::new(MemoryStore::new());
    let logger = Logger::connect(LoggerConfig::default(), store.clone()).await;

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        logger.create(LogRecord::new().with("iteration", i).with("event", "load test"));
    }

    let enqueued = start.elapsed();
    println!(
        "enqueued {} records in {:?} (~{:.0} rec/s)",
        n,
        enqueued,
        n as f64 / enqueued.as_secs_f64()
    );

    logger.shutdown(Duration::from_secs(60)).await;
    println!(
        "persisted {} records in {:?} ({} left for the disk dump)",
        store.saved_count(),
        start.elapsed(),
        n as usize - store.saved_count()
    );
}
