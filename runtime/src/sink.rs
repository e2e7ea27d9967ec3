//! JSONL lead sink: append-only, one output item per line.
//!
//! Files rotate when they exceed the size limit (`leads.jsonl` →
//! `leads.jsonl.1` → `.2` ...), keeping at most [`MAX_ROTATIONS`] old files.

use crate::progress::HarvestItem;
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Default size before rotation (100 MB).
pub const DEFAULT_MAX_SIZE: u64 = 100 * 1024 * 1024;

pub const MAX_ROTATIONS: u32 = 5;

pub struct LeadSink {
    writer: BufWriter<File>,
    path: PathBuf,
    current_size: u64,
    max_size: u64,
    /// Write progress and anomaly signals too, not only leads.
    include_signals: bool,
    written: u64,
}

impl LeadSink {
    /// Append to `path`, keeping whatever it already holds.
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_max_size(path, DEFAULT_MAX_SIZE)
    }

    /// Start `path` afresh, dropping earlier content and its rotations.
    pub fn create(path: &Path) -> Result<Self> {
        for i in 1..=MAX_ROTATIONS {
            let old = rotation_path(path, i);
            if old.exists() {
                std::fs::remove_file(&old)
                    .with_context(|| format!("failed to remove {}", old.display()))?;
            }
        }
        if path.exists() {
            File::create(path)
                .with_context(|| format!("failed to truncate {}", path.display()))?;
        }
        Self::open(path)
    }

    pub fn with_max_size(path: &Path, max_size: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = open_append(path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            current_size,
            max_size,
            include_signals: false,
            written: 0,
        })
    }

    pub fn include_signals(mut self, yes: bool) -> Self {
        self.include_signals = yes;
        self
    }

    /// Append one item. Signals are skipped unless enabled.
    pub fn write(&mut self, item: &HarvestItem) -> Result<()> {
        if item.as_lead().is_none() && !self.include_signals {
            return Ok(());
        }
        if self.current_size >= self.max_size {
            self.rotate()?;
        }
        let json = serde_json::to_string(item)?;
        writeln!(self.writer, "{json}")
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        self.current_size += json.len() as u64 + 1;
        self.written += 1;
        Ok(())
    }

    /// Lines written since the sink was opened.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("failed to flush lead sink")
    }

    fn rotate(&mut self) -> Result<()> {
        self.writer.flush()?;

        for i in (1..MAX_ROTATIONS).rev() {
            let from = rotation_path(&self.path, i);
            if from.exists() {
                let _ = std::fs::rename(&from, rotation_path(&self.path, i + 1));
            }
        }
        let _ = std::fs::rename(&self.path, rotation_path(&self.path, 1));

        self.writer = BufWriter::new(
            open_append(&self.path).context("failed to reopen lead sink after rotation")?,
        );
        self.current_size = 0;
        tracing::debug!("rotated {}", self.path.display());
        Ok(())
    }
}

impl Drop for LeadSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open lead sink: {}", path.display()))
}

/// `leads.jsonl` → `leads.jsonl.{index}`.
fn rotation_path(base: &Path, index: u32) -> PathBuf {
    let name = format!(
        "{}.{index}",
        base.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("leads.jsonl")
    );
    base.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lead::CanonicalLead;
    use crate::progress::AnomalyKind;

    fn lead(name: &str) -> HarvestItem {
        HarvestItem::Lead(CanonicalLead {
            last_name: name.into(),
            full_name: name.into(),
            source: "t".into(),
            ..CanonicalLead::default()
        })
    }

    #[test]
    fn test_writes_leads_and_skips_signals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("leads.jsonl");
        {
            let mut sink = LeadSink::open(&path).unwrap();
            sink.write(&HarvestItem::progress(1, 1, "all")).unwrap();
            sink.write(&lead("Martin")).unwrap();
            sink.write(&lead("Durand")).unwrap();
            assert_eq!(sink.written(), 2);
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: CanonicalLead = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.last_name, "Martin");
    }

    #[test]
    fn test_signals_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leads.jsonl");
        let mut sink = LeadSink::open(&path).unwrap().include_signals(true);
        sink.write(&HarvestItem::anomaly(AnomalyKind::Blocked, "Paris", 2, "HTTP 429"))
            .unwrap();
        sink.flush().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("_anomaly"));
    }

    #[test]
    fn test_create_replaces_earlier_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paris.jsonl");
        {
            let mut sink = LeadSink::with_max_size(&path, 10).unwrap();
            sink.write(&lead("Martin")).unwrap();
            sink.write(&lead("Durand")).unwrap();
        }
        assert!(rotation_path(&path, 1).exists());

        {
            let mut sink = LeadSink::create(&path).unwrap();
            sink.write(&lead("Petit")).unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("Petit"));
        assert!(!rotation_path(&path, 1).exists());
    }

    #[test]
    fn test_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leads.jsonl");
        {
            let mut sink = LeadSink::with_max_size(&path, 10).unwrap();
            sink.write(&lead("Martin")).unwrap();
            sink.write(&lead("Durand")).unwrap();
            sink.write(&lead("Petit")).unwrap();
        }
        assert!(rotation_path(&path, 1).exists());
        assert!(rotation_path(&path, 2).exists());
        let current = std::fs::read_to_string(&path).unwrap();
        assert!(current.contains("Petit"));
        assert_eq!(current.lines().count(), 1);
    }
}
