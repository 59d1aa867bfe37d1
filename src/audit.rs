//! Append-only audit trail.
//!
//! One JSON object per line. Entries are only ever appended, each with a
//! single `write_all` under the writer lock, so concurrent requests can never
//! interleave partial lines. Rotation and pruning are left to external tools.

use crate::providers::{SystemTimeProvider, TimeProvider};
use crate::safety::RiskTier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Suggested,
    Explained,
    Executed,
    Blocked,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Suggested => "suggested",
            EventKind::Explained => "explained",
            EventKind::Executed => "executed",
            EventKind::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Error { error_kind: String, message: String },
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event_kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_tier: Option<RiskTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f32>,
    #[serde(default)]
    pub hardened: bool,
    pub provider_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl AuditEntry {
    pub fn new(
        timestamp: DateTime<Utc>,
        event_kind: EventKind,
        provider_name: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            event_kind,
            goal: None,
            command_text: None,
            risk_tier: None,
            risk_score: None,
            hardened: false,
            provider_name: provider_name.into(),
            cwd: None,
            outcome: Outcome::Ok,
            approved: None,
            exit_code: None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error { .. })
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to append to audit log {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read audit log {path}: {source}")]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Aggregate view over the whole log, served by `GET /stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditStats {
    pub total_entries: usize,
    pub by_event_kind: BTreeMap<String, usize>,
    pub blocked: usize,
    pub errors: usize,
    pub providers: BTreeSet<String>,
    pub file_size_bytes: u64,
    /// Share of reported executions the user approved; 0.0 with no reports.
    pub approval_rate: f64,
}

pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<Option<File>>,
    clock: Arc<dyn TimeProvider>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_clock(path, Arc::new(SystemTimeProvider))
    }

    /// Creates an audit log with a custom clock (for testing).
    pub fn with_clock(path: impl Into<PathBuf>, clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts an entry stamped with the current time.
    pub fn entry(&self, event_kind: EventKind, provider_name: &str) -> AuditEntry {
        AuditEntry::new(self.clock.now(), event_kind, provider_name)
    }

    /// Appends `entry` as a single line.
    pub fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut line =
            serde_json::to_string(entry).map_err(|e| self.write_failure(io::Error::other(e)))?;
        line.push('\n');

        let mut writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if writer.is_none() {
            *writer = Some(self.open().map_err(|e| self.write_failure(e))?);
        }
        let Some(file) = writer.as_mut() else {
            return Err(self.write_failure(io::Error::other("audit log not open")));
        };

        if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
            // Reopen on the next append in case the file was moved away.
            *writer = None;
            return Err(self.write_failure(e));
        }
        debug!("Audit: {} via {}", entry.event_kind.as_str(), entry.provider_name);
        Ok(())
    }

    /// Like [`record`](Self::record), but failures only produce a warning.
    pub fn record_or_warn(&self, entry: &AuditEntry) {
        if let Err(e) = self.record(entry) {
            warn!("Audit entry dropped: {}", e);
        }
    }

    /// The last `limit` parseable entries, oldest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>, AuditError> {
        let mut entries = self.read_all()?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    pub fn stats(&self) -> Result<AuditStats, AuditError> {
        let entries = self.read_all()?;
        let mut stats = AuditStats {
            total_entries: entries.len(),
            file_size_bytes: fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
            ..AuditStats::default()
        };
        let (mut decided, mut approved) = (0usize, 0usize);
        for entry in &entries {
            *stats
                .by_event_kind
                .entry(entry.event_kind.as_str().to_string())
                .or_insert(0) += 1;
            if entry.event_kind == EventKind::Blocked {
                stats.blocked += 1;
            }
            if entry.is_error() {
                stats.errors += 1;
            }
            stats.providers.insert(entry.provider_name.clone());
            if let Some(yes) = entry.approved {
                decided += 1;
                approved += usize::from(yes);
            }
        }
        if decided > 0 {
            stats.approval_rate = approved as f64 / decided as f64;
        }
        Ok(stats)
    }

    fn read_all(&self) -> Result<Vec<AuditEntry>, AuditError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(AuditError::ReadFailure {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!("Skipping unparseable audit line: {}", e);
                    None
                }
            })
            .collect())
    }

    fn open(&self) -> io::Result<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&self.path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(file)
    }

    fn write_failure(&self, source: io::Error) -> AuditError {
        AuditError::WriteFailure {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::FixedTimeProvider;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn fixed_log(dir: &TempDir) -> AuditLog {
        let instant = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        AuditLog::with_clock(dir.path().join("audit.jsonl"), Arc::new(FixedTimeProvider(instant)))
    }

    fn suggested(log: &AuditLog, command: &str) -> AuditEntry {
        let mut entry = log.entry(EventKind::Suggested, "mock");
        entry.goal = Some("list files".to_string());
        entry.command_text = Some(command.to_string());
        entry.risk_tier = Some(RiskTier::Safe);
        entry.risk_score = Some(0.0);
        entry
    }

    #[test]
    fn test_record_appends_one_line_per_entry() {
        let dir = TempDir::new().unwrap();
        let log = fixed_log(&dir);

        log.record(&suggested(&log, "ls -la")).unwrap();
        log.record(&suggested(&log, "pwd")).unwrap();

        let content = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event_kind"], "suggested");
        assert_eq!(first["command_text"], "ls -la");
        assert_eq!(first["risk_tier"], "safe");
        assert_eq!(first["outcome"]["status"], "ok");
        assert_eq!(first["timestamp"], "2024-05-01T12:00:00Z");
        assert!(first.get("exit_code").is_none());
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("nested/deeper/audit.jsonl"));

        log.record(&log.entry(EventKind::Explained, "mock")).unwrap();
        assert!(log.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let log = fixed_log(&dir);
        log.record(&suggested(&log, "ls")).unwrap();

        let mode = fs::metadata(log.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_unwritable_path_is_write_failure() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be opened for appending.
        let log = AuditLog::new(dir.path());

        let err = log.record(&log.entry(EventKind::Suggested, "mock")).unwrap_err();
        assert!(matches!(err, AuditError::WriteFailure { .. }));
    }

    #[test]
    fn test_error_outcome_round_trips() {
        let dir = TempDir::new().unwrap();
        let log = fixed_log(&dir);

        let mut entry = log.entry(EventKind::Suggested, "openai:gpt-4o-mini");
        entry.goal = Some("sync photos".to_string());
        entry.outcome = Outcome::Error {
            error_kind: "provider_timeout".to_string(),
            message: "provider did not answer within 30s".to_string(),
        };
        log.record(&entry).unwrap();

        let recent = log.recent(10).unwrap();
        assert_eq!(recent, vec![entry]);
        assert!(recent[0].is_error());
    }

    #[test]
    fn test_recent_returns_tail_and_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let log = fixed_log(&dir);

        for i in 0..5 {
            log.record(&suggested(&log, &format!("echo {}", i))).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        writeln!(file, "{{not json").unwrap();

        let recent = log.recent(2).unwrap();
        let commands: Vec<_> = recent.iter().filter_map(|e| e.command_text.as_deref()).collect();
        assert_eq!(commands, vec!["echo 3", "echo 4"]);
        assert_eq!(log.recent(100).unwrap().len(), 5);
    }

    #[test]
    fn test_missing_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let log = fixed_log(&dir);

        assert!(log.recent(10).unwrap().is_empty());
        assert_eq!(log.stats().unwrap(), AuditStats::default());
    }

    #[test]
    fn test_stats() {
        let dir = TempDir::new().unwrap();
        let log = fixed_log(&dir);

        log.record(&suggested(&log, "ls")).unwrap();
        let mut blocked = log.entry(EventKind::Blocked, "mock");
        blocked.command_text = Some("rm -rf /".to_string());
        log.record(&blocked).unwrap();
        let mut failed = log.entry(EventKind::Explained, "ollama:llama3.1:8b");
        failed.outcome = Outcome::Error {
            error_kind: "provider_unavailable".to_string(),
            message: "down".to_string(),
        };
        log.record(&failed).unwrap();

        let stats = log.stats().unwrap();
        assert_eq!(stats.approval_rate, 0.0);

        for approved in [true, false, true, true] {
            let mut executed = log.entry(EventKind::Executed, "mock");
            executed.command_text = Some("ls".to_string());
            executed.approved = Some(approved);
            log.record(&executed).unwrap();
        }

        let stats = log.stats().unwrap();
        assert_eq!(stats.total_entries, 7);
        assert_eq!(stats.by_event_kind["executed"], 4);
        assert_eq!(stats.approval_rate, 0.75);
        assert_eq!(stats.by_event_kind["suggested"], 1);
        assert_eq!(stats.by_event_kind["blocked"], 1);
        assert_eq!(stats.by_event_kind["explained"], 1);
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.errors, 1);
        assert!(stats.providers.contains("ollama:llama3.1:8b"));
        assert!(stats.file_size_bytes > 0);
    }

    #[test]
    fn test_concurrent_writers_never_interleave() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(fixed_log(&dir));

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let mut entry = suggested(&log, &format!("echo worker-{}-{}", worker, i));
                        entry.goal = Some("x".repeat(512));
                        log.record(&entry).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let content = fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 400);
        for line in content.lines() {
            serde_json::from_str::<AuditEntry>(line).unwrap();
        }
    }
}
