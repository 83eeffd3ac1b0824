//! Outcome log and transfer statistics.
//!
//! The engine reports every task outcome to a [`LogSink`]. Sinks are
//! fire-and-forget: methods return nothing and implementations must swallow
//! their own failures, so a broken sink can never fail a transfer.

use crate::sync::queue::TransferDirection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub connection_id: String,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStat {
    pub timestamp: DateTime<Utc>,
    pub connection_id: String,
    pub bytes: u64,
    pub direction: TransferDirection,
}

pub trait LogSink: Send + Sync {
    fn log(&self, entry: LogEntry);
    fn transfer_stat(&self, stat: TransferStat);
}

// ─── LogCrateSink ───────────────────────────────────────────────────

/// Default sink: forwards to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn log(&self, entry: LogEntry) {
        let level = match entry.level {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        };
        log::log!(target: "sorng_sync::outcome", level, "[{}] {}", entry.connection_id, entry.message);
    }

    fn transfer_stat(&self, stat: TransferStat) {
        log::trace!(
            target: "sorng_sync::stats",
            "[{}] {:?} {} bytes",
            stat.connection_id,
            stat.direction,
            stat.bytes
        );
    }
}

// ─── MemorySink ─────────────────────────────────────────────────────

/// Bounded in-memory ring of recent entries and stats.
#[derive(Debug)]
pub struct MemorySink {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
    stats: Mutex<VecDeque<TransferStat>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            stats: Mutex::new(VecDeque::new()),
        }
    }

    /// The newest `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.recent(usize::MAX)
    }

    pub fn stats(&self) -> Vec<TransferStat> {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Whether any entry's message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|e| e.message.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn log(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    fn transfer_stat(&self, stat: TransferStat) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        if stats.len() == self.capacity {
            stats.pop_front();
        }
        stats.push_back(stat);
    }
}

// ─── SessionLog ─────────────────────────────────────────────────────

/// Per-session logging handle: stamps entries with the connection id and
/// tees them to the external sink and a local ring used by status queries.
#[derive(Clone)]
pub struct SessionLog {
    connection_id: String,
    external: Arc<dyn LogSink>,
    recent: Arc<MemorySink>,
}

impl SessionLog {
    pub fn new(connection_id: impl Into<String>, external: Arc<dyn LogSink>, capacity: usize) -> Self {
        Self {
            connection_id: connection_id.into(),
            external,
            recent: Arc::new(MemorySink::new(capacity)),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn emit(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            connection_id: self.connection_id.clone(),
            level,
            message: message.into(),
        };
        self.recent.log(entry.clone());
        self.external.log(entry);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(LogLevel::Debug, message)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogLevel::Info, message)
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(LogLevel::Warn, message)
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogLevel::Error, message)
    }

    pub fn transferred(&self, bytes: u64, direction: TransferDirection) {
        let stat = TransferStat {
            timestamp: Utc::now(),
            connection_id: self.connection_id.clone(),
            bytes,
            direction,
        };
        self.recent.transfer_stat(stat.clone());
        self.external.transfer_stat(stat);
    }

    /// Recent non-debug entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let mut out: Vec<LogEntry> = self
            .recent
            .entries()
            .into_iter()
            .filter(|e| e.level > LogLevel::Debug)
            .collect();
        let skip = out.len().saturating_sub(limit);
        out.drain(..skip);
        out
    }
}
