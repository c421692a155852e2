//! Versioned metadata record with optimistic concurrency.
//!
//! One `metadata.json` per requirement. Writers must go through
//! [`save_metadata`], which takes the metadata lock, re-reads the on-disk
//! version, and refuses to publish over a record that moved since the caller
//! loaded it. Readers never lock; stale reads are corrected by the staleness
//! machinery upstream.
use crate::config::Config;
use crate::error::CoreError;
use crate::lockfile::acquire_lock;
use crate::stage::SubagentState;
use crate::util::write_atomic;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "metadata.json";

/// Last recorded `(doc_hash, upstream_hashes)` snapshot for a downstream doc.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencySnapshot {
    #[serde(default)]
    pub doc_hash: String,
    #[serde(default)]
    pub upstream_hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Monotonic record version; starts at 1 on creation.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at_epoch_ms: u128,
    #[serde(default)]
    pub original_requirement: String,
    #[serde(default)]
    pub project_mode: String,
    #[serde(default)]
    pub initial_clarifications: String,
    #[serde(default)]
    pub global_memory_hash: String,
    #[serde(default)]
    pub global_memory_exists: bool,
    #[serde(default)]
    pub global_memory_synced_at_epoch_ms: u128,
    /// Per-downstream-doc dependency snapshots, keyed by stage name.
    #[serde(default)]
    pub dependency_state: BTreeMap<String, DependencySnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagents: Option<SubagentState>,
    /// Fields written by newer tools survive our read-modify-write.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Metadata {
    /// Explicit default-filling run on every load; serde covers missing
    /// fields, this covers semantically-empty ones.
    pub fn normalize(&mut self, config: &Config) {
        if self.project_mode.trim().is_empty() {
            self.project_mode = config.default_project_mode.as_str().to_string();
        }
    }
}

pub fn metadata_path(req_dir: &Path) -> PathBuf {
    req_dir.join(METADATA_FILE)
}

fn metadata_lock_path(meta_path: &Path) -> PathBuf {
    let mut name = meta_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| METADATA_FILE.to_string());
    name.push_str(".lock");
    meta_path.with_file_name(name)
}

fn read_record(meta_path: &Path) -> Result<Metadata> {
    let raw = match fs::read_to_string(meta_path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(CoreError::NotFound(
                "metadata.json not found, run init first".to_string(),
            )
            .into());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read {}", meta_path.display()));
        }
    };
    let meta: Metadata = serde_json::from_str(&raw)
        .with_context(|| format!("parse {}", meta_path.display()))?;
    Ok(meta)
}

/// Load the record and the version the caller must pass back to `save`.
pub fn load_metadata(req_dir: &Path, config: &Config) -> Result<(Metadata, u64)> {
    let mut meta = read_record(&metadata_path(req_dir))?;
    meta.normalize(config);
    let version = meta.version;
    Ok((meta, version))
}

/// Read-modify-write with conflict detection.
///
/// Under the metadata lock: the on-disk version is re-read and compared to
/// `expected_version`; a mismatch means another writer committed first and
/// surfaces as `VersionConflict`. On success `meta.version` is bumped and the
/// new version returned.
pub fn save_metadata(
    req_dir: &Path,
    meta: &mut Metadata,
    expected_version: u64,
    config: &Config,
    dry_run: bool,
) -> Result<u64> {
    let meta_path = metadata_path(req_dir);
    if dry_run {
        tracing::info!(path = %meta_path.display(), "dry-run: would update metadata");
        return Ok(meta.version);
    }
    let lock_path = metadata_lock_path(&meta_path);
    let _guard = acquire_lock(&lock_path, &config.metadata_lock, "metadata")?;
    let disk_version = read_record(&meta_path)?.version;
    if disk_version != expected_version {
        return Err(CoreError::VersionConflict {
            expected: expected_version,
            current: disk_version,
        }
        .into());
    }
    meta.version = disk_version + 1;
    let text = serde_json::to_string_pretty(meta).context("serialize metadata")?;
    write_atomic(&meta_path, &text)?;
    Ok(meta.version)
}

/// First write during requirement creation; the caller holds the requirement
/// lock and has just created the directory, so no conflict check applies.
pub fn write_initial_metadata(req_dir: &Path, meta: &mut Metadata) -> Result<()> {
    meta.version = 1;
    let text = serde_json::to_string_pretty(meta).context("serialize metadata")?;
    write_atomic(&metadata_path(req_dir), &text)
}

#[cfg(test)]
#[path = "metadata_tests.rs"]
mod tests;
