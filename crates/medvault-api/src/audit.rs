use std::fmt::{Display, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use medvault_core::AuditAction;
use parking_lot::Mutex;

/// One audit line: `timestamp: actor action for subject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub timestamp: String,
    pub actor: String,
    pub action: AuditAction,
    pub subject: String,
}

impl AuditEntry {
    #[must_use]
    pub fn new(
        timestamp: impl Into<String>,
        actor: impl Into<String>,
        action: AuditAction,
        subject: impl Into<String>,
    ) -> Self {
        Self { timestamp: timestamp.into(), actor: actor.into(), action, subject: subject.into() }
    }
}

impl Display for AuditEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} {} for {}", self.timestamp, self.actor, self.action, self.subject)
    }
}

/// Append-only destination for audit entries. Recording never fails the caller.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Audit log backed by a file opened in append mode; each line is flushed as
/// soon as it is written.
#[derive(Debug)]
pub struct FileAuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileAuditLog {
    /// Open (creating if needed) the audit file at `path`.
    ///
    /// # Errors
    /// Returns an error when the parent directory or the file cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create audit directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open audit log {}", path.display()))?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditLog {
    fn record(&self, entry: AuditEntry) {
        let line = entry.to_string();
        tracing::info!(target: "audit", "{line}");

        let mut file = self.file.lock();
        if let Err(err) = writeln!(file, "{line}").and_then(|()| file.flush()) {
            tracing::error!(path = %self.path.display(), error = %err, "failed to append audit line");
        }
    }
}

/// In-memory sink, used by tests and embedders that inspect the trail directly.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditLog {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl MemoryAuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    /// Rendered lines, in recording order.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.entries.lock().iter().map(ToString::to_string).collect()
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, entry: AuditEntry) {
        self.entries.lock().push(entry);
    }
}
