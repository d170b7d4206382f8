use std::path::Path;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A warn+ event as read back from the log database.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining event fields as a JSON object.
    pub fields: Option<String>,
    pub device_id: Option<String>,
    pub connection_id: Option<String>,
}

/// Filter for reading persisted records back, newest first.
///
/// `min_level = WARN` returns warnings and errors; `ERROR` returns errors only.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub min_level: Option<Level>,
    pub device_id: Option<String>,
    pub connection_id: Option<String>,
    /// Inclusive lower bound on the RFC 3339 timestamp.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

const DEFAULT_QUERY_LIMIT: u32 = 100;

/// Lower is more severe, matching `tracing::Level` ordering.
fn severity(level: Level) -> i64 {
    match level {
        Level::ERROR => 1,
        Level::WARN => 2,
        Level::INFO => 3,
        Level::DEBUG => 4,
        _ => 5,
    }
}

/// SQLite sink that persists warn+ logs, keyed by device and connection.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 severity INTEGER NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 device_id TEXT,
                 connection_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_device ON logs(device_id, id);
             CREATE INDEX IF NOT EXISTS idx_logs_connection ON logs(connection_id, id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, entry: &LogInsert) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO logs
                 (timestamp, severity, level, target, message, fields, device_id, connection_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        stmt.execute(rusqlite::params![
            entry.timestamp,
            severity(entry.level),
            entry.level.as_str(),
            entry.target,
            entry.message,
            entry.fields,
            entry.device_id,
            entry.connection_id,
        ])?;
        Ok(())
    }

    /// Every filter is optional; an unset one matches all rows.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, timestamp, level, target, message, fields, device_id, connection_id
             FROM logs
             WHERE (?1 IS NULL OR severity <= ?1)
               AND (?2 IS NULL OR device_id = ?2)
               AND (?3 IS NULL OR connection_id = ?3)
               AND (?4 IS NULL OR timestamp >= ?4)
             ORDER BY id DESC
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![
                q.min_level.map(severity),
                q.device_id,
                q.connection_id,
                q.since,
                q.limit.unwrap_or(DEFAULT_QUERY_LIMIT),
            ],
            |row| {
                Ok(LogRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    fields: row.get(5)?,
                    device_id: row.get(6)?,
                    connection_id: row.get(7)?,
                })
            },
        )?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogInsert {
    timestamp: String,
    level: Level,
    target: String,
    message: String,
    fields: Option<String>,
    device_id: Option<String>,
    connection_id: Option<String>,
}

/// tracing Layer that writes warn+ events to SQLite.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Pulls the message and the two correlation ids out of an event or span;
/// everything else lands in `fields`.
#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    device_id: Option<String>,
    connection_id: Option<String>,
}

impl FieldVisitor {
    fn put_string(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "device_id" => self.device_id = Some(value),
            "connection_id" => self.connection_id = Some(value),
            other => {
                self.fields
                    .insert(other.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        let rendered = if field.name() == "message" {
            rendered
        } else {
            rendered.trim_matches('"').to_string()
        };
        self.put_string(field.name(), rendered);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put_string(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

/// Stored on spans so child events inherit device/connection ids.
struct SpanIds {
    device_id: Option<String>,
    connection_id: Option<String>,
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if visitor.device_id.is_none() || visitor.connection_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(ids) = extensions.get::<SpanIds>() {
                        if visitor.device_id.is_none() {
                            visitor.device_id.clone_from(&ids.device_id);
                        }
                        if visitor.connection_id.is_none() {
                            visitor.connection_id.clone_from(&ids.connection_id);
                        }
                    }
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        // Never log from inside the layer; a failed write is dropped.
        let _ = self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            level,
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            device_id: visitor.device_id,
            connection_id: visitor.connection_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if visitor.device_id.is_some() || visitor.connection_id.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanIds {
                    device_id: visitor.device_id,
                    connection_id: visitor.connection_id,
                });
            }
        }
    }
}
