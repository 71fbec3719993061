//! # Audit Log
//!
//! Append-only record of every kill switch action. Entries are numbered in
//! append order and are never truncated or rewritten. An optional
//! [`AuditSink`] mirrors each entry to durable storage before the in-memory
//! append is acknowledged.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

use crate::types::Result;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Activation,
    SystemShutdown,
    ForcedShutdown,
    Cleanup,
    Verification,
    Rearm,
}

/// How it went
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Initiated,
    Success,
    Error,
    Forced,
    Passed,
    Failed,
    /// A repeated activation while an episode was already handled
    Ignored,
}

/// One immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    /// Position in the log, starting at 0
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub status: AuditStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Fields of an entry before the log assigns its identity
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub action: AuditAction,
    pub status: AuditStatus,
    pub system: Option<String>,
    pub reason: Option<String>,
    pub source: Option<String>,
    pub details: Option<Value>,
}

impl AuditRecord {
    pub fn new(action: AuditAction, status: AuditStatus) -> Self {
        Self {
            action,
            status,
            system: None,
            reason: None,
            source: None,
            details: None,
        }
    }

    pub fn system<S: Into<String>>(mut self, system: S) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn reason<S: Into<String>>(mut self, reason: S) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Durable destination for audit entries
pub trait AuditSink: Send + Sync {
    fn persist(&self, entry: &AuditEntry) -> Result<()>;
}

/// Appends each entry as one JSON line and syncs it to disk
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn persist(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }
}

/// The in-memory append-only log
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
    sink: Option<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("len", &self.len())
            .field("durable", &self.sink.is_some())
            .finish()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sink: None,
        }
    }

    pub fn with_sink(sink: Box<dyn AuditSink>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sink: Some(sink),
        }
    }

    /// Appends a record and returns the stored entry
    pub fn append(&self, record: AuditRecord) -> AuditEntry {
        let mut entries = self.entries.lock();

        let entry = AuditEntry {
            id: Uuid::new_v4(),
            sequence: entries.len() as u64,
            timestamp: Utc::now(),
            action: record.action,
            system: record.system,
            status: record.status,
            reason: record.reason,
            source: record.source,
            details: record.details,
        };

        // Persisted under the lock so the file keeps the in-memory order.
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.persist(&entry) {
                error!(
                    sequence = entry.sequence,
                    action = ?entry.action,
                    error = %e,
                    "Failed to persist audit entry"
                );
            }
        }

        entries.push(entry.clone());
        entry
    }

    /// Copy of every entry in append order
    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
