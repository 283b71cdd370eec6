use crate::logger::Logger;
use crate::record::LogRecord;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Target prefix of this crate's own diagnostics.
const OWN_TARGET: &str = env!("CARGO_CRATE_NAME");

/// `tracing_subscriber` layer that turns events into [`LogRecord`]s and
/// hands them to a [`Logger`].
///
/// Only events at `min_level` or more severe are captured. Events emitted
/// by this crate itself are never captured, otherwise a failing store
/// would feed its own error reports back into the queue.
pub struct RecordLayer {
    logger: Logger,
    min_level: Level,
    /// Total events seen by the layer (before filtering).
    pub total_events: Arc<AtomicU64>,
    /// Events handed to the logger.
    pub forwarded_events: Arc<AtomicU64>,
}

impl RecordLayer {
    pub fn new(logger: Logger, min_level: Level) -> Self {
        RecordLayer {
            logger,
            min_level,
            total_events: Arc::new(AtomicU64::new(0)),
            forwarded_events: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<S> Layer<S> for RecordLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event, _ctx: Context<'_, S>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);

        let meta = event.metadata();
        if *meta.level() > self.min_level || is_own_target(meta.target()) {
            return;
        }

        let mut fields = Map::new();
        let mut message: Option<String> = None;
        let mut visitor = FieldVisitor {
            fields: &mut fields,
            message: &mut message,
        };
        event.record(&mut visitor);

        let mut record = LogRecord::new()
            .with("timestamp", Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
            .with("level", meta.level().to_string())
            .with("target", meta.target());
        if let Some(module_path) = meta.module_path() {
            record.insert("module_path", module_path);
        }
        if let Some(file) = meta.file() {
            record.insert("file", file);
        }
        if let Some(line) = meta.line() {
            record.insert("line", line);
        }
        if let Some(message) = message {
            record.insert("message", message);
        }
        record.insert("fields", Value::Object(fields));

        self.logger.create(record);
        self.forwarded_events.fetch_add(1, Ordering::Relaxed);
    }
}

fn is_own_target(target: &str) -> bool {
    target
        .strip_prefix(OWN_TARGET)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

pub struct FieldVisitor<'a> {
    pub fields: &'a mut Map<String, Value>,
    pub message: &'a mut Option<String>,
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.fields.insert(field.name().to_string(), Value::String(format!("{:?}", value)));
        }
    }
}
