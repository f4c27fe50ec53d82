//! Resumption checkpoint and per-file status ledger.
//!
//! Both are small JSON files rewritten through a temp file and rename:
//!
//! - the checkpoint holds `{"file": ..., "row_count": n}` for the most
//!   recently touched input file only;
//! - the ledger maps file names to `"success"` / `"failed"` and is merged
//!   on every update, so verdicts from earlier runs are kept.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Row-groups completed for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCheckpoint {
    pub file: String,
    pub row_count: u64,
}

impl ProgressCheckpoint {
    pub fn new(file: impl Into<String>, row_count: u64) -> Self {
        Self {
            file: file.into(),
            row_count,
        }
    }

    /// True when this checkpoint refers to `path`, by full path or file name.
    pub fn matches(&self, path: &Path) -> bool {
        if self.file == path.display().to_string() {
            return true;
        }
        path.file_name()
            .map(|name| name.to_string_lossy() == self.file.as_str())
            .unwrap_or(false)
    }

    /// Counter to resume from when processing `path`.
    pub fn resume_offset(checkpoint: Option<&Self>, path: &Path) -> u64 {
        checkpoint
            .filter(|cp| cp.matches(path))
            .map(|cp| cp.row_count)
            .unwrap_or(0)
    }
}

/// The checkpoint file on disk.
#[derive(Debug, Clone)]
pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last checkpoint, if any. An unreadable file counts as none.
    pub fn load(&self) -> Option<ProgressCheckpoint> {
        let content = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&content) {
            Ok(cp) => Some(cp),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unreadable checkpoint");
                None
            }
        }
    }

    pub fn save(&self, checkpoint: &ProgressCheckpoint) -> Result<()> {
        let body = serde_json::to_vec(checkpoint)?;
        write_atomic(&self.path, &body)?;
        debug!(file = %checkpoint.file, row_count = checkpoint.row_count, "checkpoint saved");
        Ok(())
    }
}

/// Terminal outcome for one input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Success,
    Failed,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileStatus::Success => write!(f, "success"),
            FileStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Cumulative file name → status map on disk.
#[derive(Debug, Clone)]
pub struct StatusLedger {
    path: PathBuf,
}

impl StatusLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<BTreeMap<String, FileStatus>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read status file: {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse status file: {}", self.path.display()))
    }

    /// Merge one verdict into the ledger and persist it.
    pub fn record(&self, file: &str, status: FileStatus) -> Result<()> {
        let mut entries = self.load()?;
        entries.insert(file.to_string(), status);

        let mut body = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut body, formatter);
        entries.serialize(&mut ser)?;
        write_atomic(&self.path, &body)?;
        debug!(file, %status, "status ledger updated");
        Ok(())
    }
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// `1234567` → `"1,234,567"`.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}
