use chrono::{DateTime, Utc};
use memoria_core::{MemoriaError, MemoriaResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

/// File name of the JSONL trail inside the audit directory.
pub const AUDIT_FILE: &str = "audit.jsonl";

/// Entries kept in memory by default; older ones remain in the file.
pub const DEFAULT_MIRROR_CAPACITY: usize = 4096;

/// One line of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Proposal the entry belongs to.
    pub proposal_id: Uuid,
    /// What happened (`submitted`, `transition`, `item_executed`, ...).
    pub action: String,
    /// Action-specific payload.
    pub details: serde_json::Value,
    /// How it ended.
    pub outcome: AuditOutcome,
}

/// Result of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// The action took effect.
    Success,
    /// A reviewer or policy refused it.
    Denied,
    /// The action failed.
    Error,
}

/// Bounded window of the most recent entries.
struct Mirror {
    recent: VecDeque<AuditEntry>,
    total: usize,
    capacity: usize,
}

impl Mirror {
    fn new(capacity: usize) -> Self {
        Self {
            recent: VecDeque::new(),
            total: 0,
            capacity,
        }
    }

    fn push(&mut self, entry: AuditEntry) {
        self.total += 1;
        self.recent.push_back(entry);
        self.trim();
    }

    fn trim(&mut self) {
        while self.recent.len() > self.capacity {
            self.recent.pop_front();
        }
    }
}

/// Append-only audit log of proposal activity.
///
/// When backed by a directory, every entry is appended to
/// `<dir>/audit.jsonl` before `log` returns. Only the most recent entries
/// are kept in memory; [`AuditLog::read_all`] returns the full trail.
pub struct AuditLog {
    path: Option<PathBuf>,
    mirror: Mutex<Mirror>,
    write_lock: tokio::sync::Mutex<()>,
}

impl AuditLog {
    /// A log that keeps entries in memory only.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            mirror: Mutex::new(Mirror::new(DEFAULT_MIRROR_CAPACITY)),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open (or create) the trail under `dir`, loading the most recent
    /// existing entries.
    pub async fn open(dir: impl AsRef<Path>) -> MemoriaResult<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| MemoriaError::PersistenceWrite(format!("{}: {e}", dir.display())))?;
        let path = dir.join(AUDIT_FILE);

        let mut mirror = Mirror::new(DEFAULT_MIRROR_CAPACITY);
        for entry in read_trail(&path).await? {
            mirror.push(entry);
        }

        Ok(Self {
            path: Some(path),
            mirror: Mutex::new(mirror),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Keep at most `capacity` entries in memory.
    pub fn with_mirror_capacity(self, capacity: usize) -> Self {
        {
            let mut mirror = self.mirror.lock();
            mirror.capacity = capacity;
            mirror.trim();
        }
        self
    }

    /// Path of the JSONL file, if the log is durable.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append an entry.
    pub async fn log(&self, entry: AuditEntry) -> MemoriaResult<()> {
        info!(
            proposal_id = %entry.proposal_id,
            action = %entry.action,
            outcome = ?entry.outcome,
            "audit"
        );

        if let Some(path) = &self.path {
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            let _guard = self.write_lock.lock().await;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| MemoriaError::PersistenceWrite(format!("{}: {e}", path.display())))?;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| MemoriaError::PersistenceWrite(format!("{}: {e}", path.display())))?;
            file.flush()
                .await
                .map_err(|e| MemoriaError::PersistenceWrite(format!("{}: {e}", path.display())))?;
        }

        self.mirror.lock().push(entry);
        Ok(())
    }

    /// Convenience wrapper around [`AuditLog::log`].
    pub async fn log_action(
        &self,
        proposal_id: Uuid,
        action: impl Into<String>,
        details: serde_json::Value,
        outcome: AuditOutcome,
    ) -> MemoriaResult<()> {
        self.log(AuditEntry {
            timestamp: Utc::now(),
            proposal_id,
            action: action.into(),
            details,
            outcome,
        })
        .await
    }

    /// Recent entries of one proposal, in append order.
    pub fn entries_for(&self, proposal_id: Uuid) -> Vec<AuditEntry> {
        self.mirror
            .lock()
            .recent
            .iter()
            .filter(|e| e.proposal_id == proposal_id)
            .cloned()
            .collect()
    }

    /// Recent entries, in append order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.mirror.lock().recent.iter().cloned().collect()
    }

    /// The whole trail. Reads the file for durable logs.
    pub async fn read_all(&self) -> MemoriaResult<Vec<AuditEntry>> {
        match &self.path {
            Some(path) => {
                let _guard = self.write_lock.lock().await;
                read_trail(path).await
            }
            None => Ok(self.entries()),
        }
    }

    /// Entries recorded over the log's lifetime, including those loaded at open.
    pub fn len(&self) -> usize {
        self.mirror.lock().total
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn read_trail(path: &Path) -> MemoriaResult<Vec<AuditEntry>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(MemoriaError::PersistenceRead(format!(
                "{}: {e}",
                path.display()
            )))
        }
    };

    let mut entries = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(line).map_err(|e| {
            MemoriaError::PersistenceRead(format!("{} line {}: {e}", path.display(), n + 1))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_log() {
        let log = AuditLog::in_memory();
        let id = Uuid::new_v4();
        log.log_action(id, "submitted", serde_json::json!({}), AuditOutcome::Success)
            .await
            .unwrap();
        log.log_action(Uuid::new_v4(), "rejected", serde_json::json!({}), AuditOutcome::Denied)
            .await
            .unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries_for(id).len(), 1);
        assert!(log.path().is_none());
    }

    #[tokio::test]
    async fn test_jsonl_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        {
            let log = AuditLog::open(dir.path()).await.unwrap();
            log.log_action(id, "item_executed", serde_json::json!({"index": 0}), AuditOutcome::Success)
                .await
                .unwrap();
            log.log_action(id, "item_executed", serde_json::json!({"index": 1}), AuditOutcome::Error)
                .await
                .unwrap();
        }

        let raw = std::fs::read_to_string(dir.path().join(AUDIT_FILE)).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.contains("\"outcome\":\"error\""));

        let reopened = AuditLog::open(dir.path()).await.unwrap();
        let entries = reopened.entries_for(id);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].outcome, AuditOutcome::Error);
        assert_eq!(entries[1].details["index"], 1);
    }

    #[tokio::test]
    async fn test_mirror_is_bounded_but_file_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let log = AuditLog::open(dir.path()).await.unwrap().with_mirror_capacity(3);
        for index in 0..10 {
            log.log_action(id, "item_executed", serde_json::json!({"index": index}), AuditOutcome::Success)
                .await
                .unwrap();
        }

        let recent = log.entries_for(id);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].details["index"], 7);
        assert_eq!(log.len(), 10);

        let all = log.read_all().await.unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].details["index"], 0);
    }

    #[tokio::test]
    async fn test_in_memory_mirror_drops_oldest() {
        let log = AuditLog::in_memory().with_mirror_capacity(2);
        for action in ["submitted", "transition", "reviewed"] {
            log.log_action(Uuid::nil(), action, serde_json::json!({}), AuditOutcome::Success)
                .await
                .unwrap();
        }
        let actions: Vec<String> = log.read_all().await.unwrap().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec!["transition", "reviewed"]);
        assert_eq!(log.len(), 3);
        assert!(!log.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_line_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(AUDIT_FILE), "{not json}\n").unwrap();
        let err = AuditLog::open(dir.path()).await.err().unwrap();
        assert!(matches!(err, MemoriaError::PersistenceRead(_)));
    }
}
