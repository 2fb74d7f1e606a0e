//! Ring-buffered log capture feeding the `/ws` log stream.
//!
//! Installed as a `tracing_subscriber::Layer` alongside the terminal `fmt`
//! layer, so every event the operator sees in the terminal is also pushed
//! onto a bounded in-memory ring and broadcast to connected WebSocket
//! clients.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const RING_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// Shared sink: a bounded ring buffer plus a broadcast channel for live
/// subscribers. Cloned cheaply into handlers via the inner `Arc`s.
#[derive(Clone)]
pub struct LogSink {
    ring: std::sync::Arc<Mutex<VecDeque<LogRecord>>>,
    tx: broadcast::Sender<LogRecord>,
}

impl LogSink {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            ring: std::sync::Arc::new(Mutex::new(VecDeque::with_capacity(RING_CAPACITY))),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.tx.subscribe()
    }

    /// Snapshot of the most recent lines, oldest first.
    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.ring.lock().expect("log ring poisoned").iter().cloned().collect()
    }

    fn push(&self, record: LogRecord) {
        {
            let mut ring = self.ring.lock().expect("log ring poisoned");
            if ring.len() >= RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }
        // No subscribers is the common case; a send error just means the
        // broadcast channel currently has none.
        let _ = self.tx.send(record);
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

/// `tracing_subscriber::Layer` that mirrors every event into a `LogSink`.
pub struct RingBufferLayer {
    sink: LogSink,
}

impl RingBufferLayer {
    pub fn new(sink: LogSink) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for RingBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let level = match *event.metadata().level() {
            Level::ERROR => "ERROR",
            Level::WARN => "WARN",
            Level::INFO => "INFO",
            Level::DEBUG => "DEBUG",
            Level::TRACE => "TRACE",
        };
        self.sink.push(LogRecord {
            timestamp: Utc::now(),
            level: level.to_string(),
            message: visitor.message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_caps_at_capacity() {
        let sink = LogSink::new();
        for i in 0..(RING_CAPACITY + 10) {
            sink.push(LogRecord {
                timestamp: Utc::now(),
                level: "INFO".to_string(),
                message: format!("line {i}"),
            });
        }
        let snapshot = sink.snapshot();
        assert_eq!(snapshot.len(), RING_CAPACITY);
        assert_eq!(snapshot.last().unwrap().message, format!("line {}", RING_CAPACITY + 9));
    }

    #[tokio::test]
    async fn subscribers_receive_pushed_records() {
        let sink = LogSink::new();
        let mut rx = sink.subscribe();
        sink.push(LogRecord {
            timestamp: Utc::now(),
            level: "INFO".to_string(),
            message: "hello".to_string(),
        });
        let record = rx.recv().await.unwrap();
        assert_eq!(record.message, "hello");
    }
}
