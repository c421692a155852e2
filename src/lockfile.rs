//! Filesystem-backed advisory locks with stale-owner reclamation.
//!
//! A lock is a marker file created with `O_CREAT|O_EXCL` next to the resource
//! it protects; the payload records the owner pid plus a process-start
//! signature so a pid recycled by the OS is not mistaken for the original
//! owner. Waiters poll until the configured timeout and may reclaim a marker
//! only when it is older than the staleness threshold AND the recorded owner
//! is verifiably gone (dead pid, or live pid with a different start
//! signature). A live owner is never robbed, no matter how old the marker is.
use crate::config::LockTuning;
use crate::error::CoreError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    #[serde(default)]
    start: String,
}

/// Held lock; the marker file is removed on drop (owner-checked).
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Explicit release; equivalent to dropping the guard.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        release_lock_file(&self.path);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Acquire the marker at `lock_path`, polling until `tuning.timeout`.
///
/// `name` labels the lock class ("metadata", "requirement") in errors.
pub fn acquire_lock(lock_path: &Path, tuning: &LockTuning, name: &'static str) -> Result<LockGuard> {
    if let Some(parent) = lock_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    let started = Instant::now();
    loop {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(mut file) => {
                let pid = std::process::id();
                let owner = LockOwner {
                    pid,
                    start: process_start_signature(pid).unwrap_or_default(),
                };
                let payload = serde_json::to_vec(&owner).context("serialize lock owner")?;
                file.write_all(&payload)
                    .with_context(|| format!("write {}", lock_path.display()))?;
                return Ok(LockGuard {
                    path: lock_path.to_path_buf(),
                    released: false,
                });
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if try_reclaim_stale(lock_path, tuning) {
                    tracing::info!(lock = %lock_path.display(), "reclaimed stale lock");
                    continue;
                }
                if started.elapsed() > tuning.timeout {
                    return Err(CoreError::LockTimeout {
                        name,
                        path: lock_path.to_path_buf(),
                        waited_ms: started.elapsed().as_millis(),
                    }
                    .into());
                }
                std::thread::sleep(tuning.poll);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("create {}", lock_path.display()));
            }
        }
    }
}

/// Returns true when the marker was removed and acquisition should retry
/// immediately. Errors while inspecting the marker mean another process may be
/// mid-release; they are treated as "not reclaimable" and retried via polling.
fn try_reclaim_stale(lock_path: &Path, tuning: &LockTuning) -> bool {
    let Ok(meta) = fs::metadata(lock_path) else {
        // Marker vanished between create attempt and inspection.
        return true;
    };
    let age = meta
        .modified()
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok());
    let Some(age) = age else {
        return false;
    };
    if age <= tuning.stale {
        return false;
    }
    let owner = read_lock_owner(lock_path);
    let Some(owner) = owner else {
        // Unreadable payload on an over-age marker: treat as abandoned.
        return remove_marker(lock_path);
    };
    if !pid_running(owner.pid) {
        return remove_marker(lock_path);
    }
    // Owner pid is alive. Reclaim only on a provable pid reuse: both the
    // recorded signature and the current one must be known and differ. When
    // the current signature cannot be determined we conservatively keep the
    // lock in place rather than risk robbing a live owner.
    if !owner.start.is_empty() {
        if let Some(current) = process_start_signature(owner.pid) {
            if !current.is_empty() && current != owner.start {
                return remove_marker(lock_path);
            }
        }
    }
    false
}

fn remove_marker(lock_path: &Path) -> bool {
    match fs::remove_file(lock_path) {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => true,
        Err(err) => {
            tracing::warn!(lock = %lock_path.display(), %err, "failed to remove stale lock");
            false
        }
    }
}

fn read_lock_owner(lock_path: &Path) -> Option<LockOwner> {
    let raw = fs::read_to_string(lock_path).ok()?;
    serde_json::from_str(raw.trim()).ok()
}

/// Delete the marker only if this process is the recorded owner. Releasing a
/// lock now held by someone else is a benign no-op.
fn release_lock_file(lock_path: &Path) {
    let Some(owner) = read_lock_owner(lock_path) else {
        return;
    };
    let pid = std::process::id();
    if owner.pid != pid {
        return;
    }
    if !owner.start.is_empty() {
        if let Some(current) = process_start_signature(pid) {
            if !current.is_empty() && current != owner.start {
                return;
            }
        }
    }
    if let Err(err) = fs::remove_file(lock_path) {
        if err.kind() != ErrorKind::NotFound {
            tracing::warn!(lock = %lock_path.display(), %err, "failed to release lock");
        }
    }
}

/// Signal-0 liveness probe. EPERM means the pid exists but belongs to another
/// user, which still counts as running.
pub fn pid_running(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    !matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(code) if code == libc::ESRCH
    )
}

/// Kernel start-time signature for a pid, used to detect pid reuse.
///
/// Prefers field 22 (`starttime`) of `/proc/<pid>/stat`; the executable name
/// in field 2 may contain spaces, so fields are counted after the closing
/// paren. Falls back to `ps -o lstart=` where procfs is unavailable. `None`
/// means the signature could not be determined.
pub fn process_start_signature(pid: u32) -> Option<String> {
    if pid == 0 {
        return None;
    }
    if let Ok(raw) = fs::read_to_string(format!("/proc/{pid}/stat")) {
        if let Some(idx) = raw.rfind(')') {
            let fields: Vec<&str> = raw[idx + 1..].split_whitespace().collect();
            // starttime is the 22nd stat field; 19 fields past the comm.
            if let Some(start) = fields.get(19) {
                return Some((*start).to_string());
            }
        }
    }
    let output = std::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "lstart="])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
#[path = "lockfile_tests.rs"]
mod tests;
