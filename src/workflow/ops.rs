//! `list`, `set-active`, `sync-memory`, and `final-check` commands.
use super::{lock_requirement, resolve_target, CommandContext};
use crate::cli::{FinalCheckArgs, ListArgs, SetActiveArgs, SyncMemoryArgs};
use crate::error::CoreError;
use crate::output::emit;
use crate::requirement::{find_requirement, get_active, list_requirements, set_active, sync_memory};
use crate::review::{final_check, ReviewIssue};
use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Serialize)]
struct ListedRequirement {
    path: String,
    active: bool,
}

pub fn run_list(ctx: &CommandContext, _args: &ListArgs) -> Result<()> {
    let items = list_requirements(&ctx.config)?;
    let active = get_active(&ctx.config)?;
    if !ctx.json {
        for item in &items {
            let mark = if active.as_deref() == Some(item.as_path()) {
                '*'
            } else {
                ' '
            };
            println!("{mark} {}", item.display());
        }
        return Ok(());
    }
    let requirements: Vec<ListedRequirement> = items
        .iter()
        .map(|item| ListedRequirement {
            path: item.display().to_string(),
            active: active.as_deref() == Some(item.as_path()),
        })
        .collect();
    emit(
        true,
        "requirements listed",
        &serde_json::json!({
            "count": requirements.len(),
            "requirements": requirements,
        }),
    )
}

pub fn run_set_active(ctx: &CommandContext, args: &SetActiveArgs) -> Result<()> {
    // No active-pointer fallback here: pointing the marker at itself is never
    // what the caller meant.
    let path: PathBuf = if let Some(path) = &args.target.path {
        path.clone()
    } else if let Some(name) = &args.target.name {
        let matches = find_requirement(&ctx.config, name)?;
        match matches.len() {
            1 => matches.into_iter().next().unwrap_or_default(),
            0 => return Err(CoreError::NotFound(format!("requirement not found: {name}")).into()),
            _ => {
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
        }
    } else {
        return Err(CoreError::InvalidInput("use --name or --path".to_string()).into());
    };
    if !path.is_dir() {
        return Err(
            CoreError::NotFound(format!("requirement path not found: {}", path.display())).into(),
        );
    }
    if ctx.dry_run {
        tracing::info!(path = %path.display(), "dry-run: would set active");
        return emit(
            ctx.json,
            &format!("dry-run: would set active: {}", path.display()),
            &serde_json::json!({"path": path.display().to_string()}),
        );
    }
    set_active(&ctx.config, &path)?;
    emit(
        ctx.json,
        &format!("active: {}", path.display()),
        &serde_json::json!({"path": path.display().to_string()}),
    )
}

pub fn run_sync_memory(ctx: &CommandContext, args: &SyncMemoryArgs) -> Result<()> {
    let path = resolve_target(ctx, &args.target)?;
    let (hash, exists) = if ctx.dry_run {
        sync_memory(&path, &ctx.config, true)?
    } else {
        let guard = lock_requirement(ctx, &path)?;
        let result = sync_memory(&path, &ctx.config, false)?;
        guard.release();
        result
    };
    emit(
        ctx.json,
        &format!("memory synced: {}", path.display()),
        &serde_json::json!({
            "path": path.display().to_string(),
            "global_memory_hash": hash,
            "global_memory_exists": exists,
        }),
    )
}

pub fn run_final_check(ctx: &CommandContext, args: &FinalCheckArgs) -> Result<()> {
    let path = resolve_target(ctx, &args.target)?;
    let write_back = !ctx.dry_run;
    let issues: Vec<ReviewIssue> = if write_back {
        let guard = lock_requirement(ctx, &path)?;
        let issues = final_check(&path, &ctx.config, true)?;
        guard.release();
        issues
    } else {
        final_check(&path, &ctx.config, false)?
    };
    if !ctx.json {
        for issue in &issues {
            println!("- [{}] {}", issue.code, issue.question);
        }
    }
    emit(
        ctx.json,
        &format!("final-check issues: {}", issues.len()),
        &serde_json::json!({
            "path": path.display().to_string(),
            "count": issues.len(),
            "issues": issues,
        }),
    )
}
