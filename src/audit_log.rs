//! Session audit log
//!
//! Appends one JSON line per lifecycle transition for compliance and
//! debugging. Secrets are never written; only generations, statuses and
//! identifiers that are safe to share.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::session::{Generation, SessionStatus};

/// Entry in the audit log
#[derive(Debug, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub entry_type: &'static str,
    pub generation: Generation,
    pub status: SessionStatus,
    pub details: Value,
}

impl AuditEntry {
    pub fn new(
        entry_type: &'static str,
        generation: Generation,
        status: SessionStatus,
        details: Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            entry_type,
            generation,
            status,
            details,
        }
    }
}

/// Append-only JSONL writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// # Arguments
    /// * `log_path` - Path to the audit log file (JSONL format)
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            path: log_path.into(),
        }
    }

    fn write(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let json = serde_json::to_string(entry)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Record an entry. Write failures are logged and never fail the session.
    pub fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.write(&entry) {
            tracing::warn!(
                error = %e,
                path = %self.path.display(),
                entry_type = entry.entry_type,
                "Failed to write audit log entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::NamedTempFile;

    #[test]
    fn test_appends_jsonl_entries() {
        let temp_file = NamedTempFile::new().unwrap();
        let log = AuditLog::new(temp_file.path());

        log.record(AuditEntry::new(
            "session_started",
            Generation(1),
            SessionStatus::CreatingIntent,
            json!({ "amount": 500, "currency": "EUR" }),
        ));
        log.record(AuditEntry::new(
            "session_succeeded",
            Generation(2),
            SessionStatus::Succeeded,
            json!({ "confirmation_id": "conf_123" }),
        ));

        let content = std::fs::read_to_string(temp_file.path()).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["entry_type"], "session_started");
        assert_eq!(lines[0]["generation"], 1);
        assert_eq!(lines[1]["status"]["state"], "succeeded");
    }

    #[test]
    fn test_unwritable_path_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending
        let log = AuditLog::new(dir.path());
        log.record(AuditEntry::new(
            "session_reset",
            Generation(1),
            SessionStatus::Idle,
            json!({}),
        ));
    }
}
