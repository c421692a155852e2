//! Per-command step functions behind the CLI.
//!
//! Each `run_*` resolves its target requirement, takes the requirement lock
//! for the duration of any mutation, and emits one result line.
mod init;
mod ops;
mod subagent;

pub use init::run_init;
pub use ops::{run_final_check, run_list, run_set_active, run_sync_memory};
pub use subagent::{
    run_subagent_context, run_subagent_init, run_subagent_stage, run_subagent_status,
};

use crate::cli::TargetArgs;
use crate::config::Config;
use crate::lockfile::{acquire_lock, LockGuard};
use crate::requirement::{requirement_lock_path, resolve_requirement};
use anyhow::Result;
use std::path::{Path, PathBuf};

/// Immutable per-invocation context threaded through every command.
pub struct CommandContext {
    pub config: Config,
    pub json: bool,
    pub dry_run: bool,
}

fn resolve_target(ctx: &CommandContext, target: &TargetArgs) -> Result<PathBuf> {
    resolve_requirement(&ctx.config, target.path.as_deref(), target.name.as_deref())
}

fn lock_requirement(ctx: &CommandContext, req_dir: &Path) -> Result<LockGuard> {
    acquire_lock(
        &requirement_lock_path(req_dir),
        &ctx.config.requirement_lock,
        "requirement",
    )
}
