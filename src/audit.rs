//! Append-only audit log for broker, enforcer, limiter and relay decisions.
//!
//! Every record is one JSON object per line. Recording never fails from the
//! caller's point of view: write errors are counted and reported through
//! `tracing`, so the operation being audited always proceeds.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tracing::error;

/// Audit event type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// An agent submitted an access request.
    AccessRequested,
    /// An access request was approved and a session issued.
    AccessApproved,
    /// An access request was denied.
    AccessDenied,
    /// A session was explicitly revoked.
    SessionRevoked,
    /// A session reached its expiry.
    SessionExpired,
    /// The scope enforcer rejected an operation.
    ScopeDenied,
    /// The rate limiter rejected a request.
    RateLimited,
    /// A relay connection was opened.
    ConnectionOpened,
    /// A relay connection was closed.
    ConnectionClosed,
    /// A message arrived for a correlation that no longer exists.
    OrphanedMessage,
}

#[derive(Debug, Serialize)]
struct AuditEntry<'a> {
    timestamp: String,
    event_type: AuditEventType,
    attributes: &'a serde_json::Value,
}

/// Audit log writing structured JSON lines to an append-only sink.
pub struct AuditLog {
    writer: Mutex<Box<dyn Write + Send>>,
    failures: AtomicU64,
    recorded: AtomicU64,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("recorded", &self.recorded())
            .field("failures", &self.failures())
            .finish()
    }
}

impl AuditLog {
    /// Open an audit log that appends to the given file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file (or its parent directory) cannot be created.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self::from_writer(Box::new(file)))
    }

    /// Create an audit log over an arbitrary writer (for testing).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            failures: AtomicU64::new(0),
            recorded: AtomicU64::new(0),
        }
    }

    /// Audit log that discards every record.
    pub fn discard() -> Self {
        Self::from_writer(Box::new(std::io::sink()))
    }

    /// Append one record. Never returns an error.
    pub fn record(&self, event_type: AuditEventType, attributes: serde_json::Value) {
        match self.write_entry(event_type, &attributes) {
            Ok(()) => {
                self.recorded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    event_type = ?event_type,
                    attributes = %attributes,
                    error = %e,
                    "audit write failed"
                );
            }
        }
    }

    /// Number of records successfully written.
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Number of records that could not be written.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn write_entry(
        &self,
        event_type: AuditEventType,
        attributes: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            attributes,
        };
        let line = serde_json::to_string(&entry)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("audit lock poisoned: {e}"))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}
