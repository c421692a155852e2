//! Requirement store layout, active pointer, and global memory snapshot.
//!
//! A requirement lives at `<spec_dir>/<date>/<name>/`; the date level keeps
//! listings browsable and names only need to be unique within a day.
use crate::config::Config;
use crate::error::CoreError;
use crate::metadata::{load_metadata, save_metadata};
use crate::util::{now_epoch_ms, sha256_hex, utc_date_string};
use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const ACTIVE_FILE: &str = ".active";
pub const GLOBAL_MEMORY_FILE: &str = "00-global-memory.md";

pub fn requirement_dir(config: &Config, date: &str, name: &str) -> PathBuf {
    config.spec_dir.join(date).join(name)
}

/// Coarse per-requirement lock marker, hidden next to the directory so the
/// lock can be taken before the directory exists.
pub fn requirement_lock_path(req_dir: &Path) -> PathBuf {
    let name = req_dir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let parent = req_dir.parent().map(Path::to_path_buf).unwrap_or_default();
    parent.join(format!(".{name}.lock"))
}

fn active_file(config: &Config) -> PathBuf {
    config.spec_dir.join(ACTIVE_FILE)
}

pub fn set_active(config: &Config, req_dir: &Path) -> Result<()> {
    fs::create_dir_all(&config.spec_dir)
        .with_context(|| format!("create {}", config.spec_dir.display()))?;
    let path = active_file(config);
    fs::write(&path, format!("{}\n", req_dir.display()))
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Active requirement if the pointer exists and still points at a directory.
pub fn get_active(config: &Config) -> Result<Option<PathBuf>> {
    let path = active_file(config);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let target = PathBuf::from(raw.trim());
    if target.as_os_str().is_empty() || !target.exists() {
        return Ok(None);
    }
    Ok(Some(target))
}

/// All requirement directories under the spec tree, sorted by path.
pub fn list_requirements(config: &Config) -> Result<Vec<PathBuf>> {
    let mut items = Vec::new();
    let spec_dir = &config.spec_dir;
    let entries = match fs::read_dir(spec_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(items),
        Err(err) => return Err(err).with_context(|| format!("read {}", spec_dir.display())),
    };
    for entry in entries {
        let date_dir = entry
            .with_context(|| format!("read {}", spec_dir.display()))?
            .path();
        if !date_dir.is_dir() {
            continue;
        }
        for entry in
            fs::read_dir(&date_dir).with_context(|| format!("read {}", date_dir.display()))?
        {
            let req_dir = entry
                .with_context(|| format!("read {}", date_dir.display()))?
                .path();
            if req_dir.is_dir() {
                items.push(req_dir);
            }
        }
    }
    items.sort();
    Ok(items)
}

pub fn find_requirement(config: &Config, name: &str) -> Result<Vec<PathBuf>> {
    Ok(list_requirements(config)?
        .into_iter()
        .filter(|path| path.file_name().is_some_and(|n| n == name))
        .collect())
}

/// Resolve the requirement a command targets: explicit `--path` wins, then
/// `--name` lookup (ambiguity is an error), then the active pointer.
pub fn resolve_requirement(
    config: &Config,
    path: Option<&Path>,
    name: Option<&str>,
) -> Result<PathBuf> {
    if let Some(path) = path {
        if !path.is_dir() {
            return Err(CoreError::NotFound(format!(
                "requirement path not found: {}",
                path.display()
            ))
            .into());
        }
        return Ok(path.to_path_buf());
    }
    if let Some(name) = name {
        let matches = find_requirement(config, name)?;
        if matches.len() > 1 {
            let candidates: Vec<String> = matches
                .iter()
                .map(|path| format!("- {}", path.display()))
                .collect();
            return Err(CoreError::InvalidInput(format!(
                "multiple requirements found for name={name}, use --path:\n{}",
                candidates.join("\n")
            ))
            .into());
        }
        return matches.into_iter().next().ok_or_else(|| {
            anyhow::Error::from(CoreError::NotFound(format!("requirement not found: {name}")))
        });
    }
    get_active(config)?.ok_or_else(|| {
        anyhow::Error::from(CoreError::NotFound(
            "no active requirement, pass --path or --name".to_string(),
        ))
    })
}

pub fn global_memory_path(config: &Config) -> PathBuf {
    config.spec_dir.join(GLOBAL_MEMORY_FILE)
}

/// Hash of the global memory file; empty when the file is absent or blank.
pub fn global_memory_hash(config: &Config) -> Result<String> {
    let path = global_memory_path(config);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(String::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    if text.trim().is_empty() {
        return Ok(String::new());
    }
    Ok(sha256_hex(text.as_bytes()))
}

/// Refresh the requirement's global memory snapshot in metadata; returns the
/// recorded hash and whether the memory file exists.
pub fn sync_memory(req_dir: &Path, config: &Config, dry_run: bool) -> Result<(String, bool)> {
    let (mut meta, version) = load_metadata(req_dir, config)?;
    meta.global_memory_hash = global_memory_hash(config)?;
    meta.global_memory_exists = global_memory_path(config).exists();
    meta.global_memory_synced_at_epoch_ms = now_epoch_ms()?;
    let hash = meta.global_memory_hash.clone();
    let exists = meta.global_memory_exists;
    save_metadata(req_dir, &mut meta, version, config, dry_run)?;
    Ok((hash, exists))
}

/// Lowercase, ascii-alphanumeric, dash-separated, at most 64 chars.
pub fn slugify(text: &str) -> String {
    let mut out = String::new();
    let mut pending_dash = false;
    for ch in text.trim().chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else {
            pending_dash = true;
        }
    }
    out.truncate(64);
    out.trim_matches('-').to_string()
}

/// Derive a directory name from the title, then the requirement text, then a
/// digest fallback that is always non-empty.
pub fn auto_requirement_name(title: Option<&str>, requirement_text: &str) -> Result<String> {
    if let Some(title) = title {
        let slug = slugify(title);
        if !slug.is_empty() {
            return Ok(slug);
        }
    }
    for line in requirement_text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let slug = slugify(line);
        if !slug.is_empty() {
            return Ok(slug);
        }
    }
    let seed = if requirement_text.is_empty() {
        "requirement"
    } else {
        requirement_text
    };
    let digest = &sha256_hex(seed.as_bytes())[..8];
    Ok(format!(
        "req-{}-{digest}",
        utc_date_string()?.replace('-', "")
    ))
}

/// First `base`, `base-2`, `base-3`, ... that does not exist for the date.
pub fn next_available_name(config: &Config, date: &str, base: &str) -> String {
    let mut candidate = base.to_string();
    let mut idx = 2;
    while requirement_dir(config, date, &candidate).exists() {
        candidate = format!("{base}-{idx}");
        idx += 1;
    }
    candidate
}

/// Explicit title, else the first non-empty requirement line (trimmed of list
/// markers, capped at 64 chars), else the directory name.
pub fn auto_requirement_title(
    title: Option<&str>,
    requirement_text: &str,
    fallback_name: &str,
) -> String {
    if let Some(title) = title {
        let title = title.trim();
        if !title.is_empty() {
            return title.to_string();
        }
    }
    for line in requirement_text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let cleaned = line
            .trim_start_matches(['-', '*', '+', '.', ')', ' '])
            .trim_start_matches(|c: char| c.is_ascii_digit())
            .trim_start_matches(['.', ')', ' '])
            .trim();
        if !cleaned.is_empty() {
            return cleaned.chars().take(64).collect();
        }
    }
    fallback_name.to_string()
}

#[cfg(test)]
#[path = "requirement_tests.rs"]
mod tests;
