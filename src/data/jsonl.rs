//! Line-delimited JSON helpers
//!
//! One JSON object per line, UTF-8, blank lines ignored. Reading is
//! permissive: lines that fail to parse are skipped rather than failing the
//! whole file.

use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// Read every parseable JSON object from a JSONL file, preserving order.
pub fn read_values(path: &Path) -> Result<Vec<Value>> {
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    let contents = fs::read_to_string(path)?;
    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => rows.push(value),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(path = %path.display(), skipped, "skipped unparseable jsonl lines");
    }
    Ok(rows)
}

/// Write serializable records to a JSONL file, creating parent directories.
pub fn write_records<T: serde::Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = String::new();
    for row in rows {
        out.push_str(&serde_json::to_string(row)?);
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}
