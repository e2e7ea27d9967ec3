//! Persisted progress ledger for resumable batches.
//!
//! A flat JSON object keyed by job id. It is loaded once at batch start and
//! rewritten (tmp file + rename) after every finished job, so a crash never
//! leaves a torn file behind.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Done,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub status: JobStatus,
    pub leads: u64,
    pub with_email: u64,
    pub with_phone: u64,
    pub anomalies: u64,
    pub elapsed_ms: u64,
    /// RFC 3339 completion time.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct ProgressLedger {
    path: PathBuf,
    entries: BTreeMap<String, LedgerEntry>,
}

impl ProgressLedger {
    /// Load the ledger, or start an empty one when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read ledger: {}", path.display()))?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content)
                    .with_context(|| format!("corrupt ledger: {}", path.display()))?
            }
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Path from `HARVEST_LEDGER_PATH`, else `~/.lead-harvest/ledger.json`.
    pub fn default_path() -> PathBuf {
        if let Ok(custom) = std::env::var("HARVEST_LEDGER_PATH") {
            if !custom.trim().is_empty() {
                return PathBuf::from(custom);
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".lead-harvest")
            .join("ledger.json")
    }

    pub fn is_done(&self, job: &str) -> bool {
        self.entries
            .get(job)
            .is_some_and(|e| e.status == JobStatus::Done)
    }

    pub fn get(&self, job: &str) -> Option<&LedgerEntry> {
        self.entries.get(job)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a finished job and persist immediately.
    pub fn record(&mut self, job: &str, entry: LedgerEntry) -> Result<()> {
        self.entries.insert(job.to_string(), entry);
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.entries)?)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace ledger {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: JobStatus) -> LedgerEntry {
        LedgerEntry {
            status,
            leads: 12,
            with_email: 3,
            with_phone: 9,
            anomalies: 0,
            elapsed_ms: 800,
            timestamp: chrono::Utc::now().to_rfc3339(),
            error: None,
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ProgressLedger::load(&dir.path().join("nope.json")).unwrap();
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_record_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("ledger.json");
        let mut ledger = ProgressLedger::load(&path).unwrap();
        ledger.record("paris", entry(JobStatus::Done)).unwrap();
        ledger
            .record(
                "lyon",
                LedgerEntry {
                    error: Some("timed out after 60s".into()),
                    ..entry(JobStatus::Timeout)
                },
            )
            .unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = ProgressLedger::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.is_done("paris"));
        assert!(!reloaded.is_done("lyon"));
        assert_eq!(reloaded.get("lyon").unwrap().status, JobStatus::Timeout);
    }

    #[test]
    fn test_corrupt_ledger_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = ProgressLedger::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("corrupt ledger"));
    }
}
