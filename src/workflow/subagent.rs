//! Stage orchestration commands: init, context, stage update, status.
use super::{lock_requirement, resolve_target, CommandContext};
use crate::cli::{
    SubagentContextArgs, SubagentInitArgs, SubagentStageArgs, SubagentStatusArgs,
};
use crate::orchestrator::{
    init_subagent_state, stage_context, stage_status, update_stage, StageUpdate,
};
use crate::output::emit;
use crate::stage::{Stage, StageStatus, SubagentState, STAGE_ORDER};
use anyhow::Result;
use std::collections::BTreeMap;

fn status_map(root: &SubagentState) -> BTreeMap<&'static str, &'static str> {
    STAGE_ORDER
        .iter()
        .map(|stage| (stage.as_str(), root.stage_state(*stage).status.as_str()))
        .collect()
}

pub fn run_subagent_init(ctx: &CommandContext, args: &SubagentInitArgs) -> Result<()> {
    let path = resolve_target(ctx, &args.target)?;
    let state = if ctx.dry_run {
        init_subagent_state(&path, &ctx.config, true, args.reset)?
    } else {
        let guard = lock_requirement(ctx, &path)?;
        let state = init_subagent_state(&path, &ctx.config, false, args.reset)?;
        guard.release();
        state
    };
    emit(
        ctx.json,
        &format!("subagent state initialized: {}", path.display()),
        &serde_json::json!({
            "path": path.display().to_string(),
            "current_stage": state.current_stage,
            "stages": status_map(&state),
        }),
    )
}

pub fn run_subagent_context(ctx: &CommandContext, args: &SubagentContextArgs) -> Result<()> {
    let path = resolve_target(ctx, &args.target)?;
    let stage = Stage::parse(&args.stage)?;
    // Context repairs state when needed, so it runs under the lock too.
    let guard = lock_requirement(ctx, &path)?;
    let context = stage_context(&path, &ctx.config, stage)?;
    guard.release();
    emit(
        ctx.json,
        &format!("subagent context ready: {}", context.stage),
        &serde_json::json!({
            "path": path.display().to_string(),
            "context": context,
        }),
    )
}

pub fn run_subagent_stage(ctx: &CommandContext, args: &SubagentStageArgs) -> Result<()> {
    let path = resolve_target(ctx, &args.target)?;
    let stage = Stage::parse(&args.stage)?;
    let status = StageStatus::parse(&args.status)?;
    let update = StageUpdate {
        stage,
        status,
        agent: &args.agent,
        notes: &args.notes,
        dry_run: ctx.dry_run,
        force: args.force,
    };
    let state = if ctx.dry_run {
        update_stage(&path, &ctx.config, &update)?
    } else {
        let guard = lock_requirement(ctx, &path)?;
        let state = update_stage(&path, &ctx.config, &update)?;
        guard.release();
        state
    };
    let stage_state = state.stage_state(stage);
    emit(
        ctx.json,
        &format!("subagent stage updated: {stage}={}", stage_state.status),
        &serde_json::json!({
            "path": path.display().to_string(),
            "stage": stage.as_str(),
            "status": stage_state.status.as_str(),
            "current_stage": state.current_stage,
            "last_reopen": state.last_reopen,
            "validation_errors": stage_state.validation_errors,
        }),
    )
}

pub fn run_subagent_status(ctx: &CommandContext, args: &SubagentStatusArgs) -> Result<()> {
    let path = resolve_target(ctx, &args.target)?;
    let report = if args.normalize {
        let guard = lock_requirement(ctx, &path)?;
        let report = stage_status(&path, &ctx.config, true)?;
        guard.release();
        report
    } else {
        stage_status(&path, &ctx.config, false)?
    };
    if ctx.json {
        return emit(true, "subagent status", &report);
    }
    println!("requirement: {}", path.display());
    println!("current_stage: {}", report.current_stage);
    if !report.stale_stages.is_empty() {
        println!("stale_stages: {}", report.stale_stages.join(", "));
    }
    if let Some(reopen) = &report.last_reopen {
        println!("last_reopen: {} ({})", reopen.stage, reopen.reason);
    }
    for stage in STAGE_ORDER {
        let state = report.stages.get(stage.as_str()).cloned().unwrap_or_default();
        println!("- {stage}: {} ({})", state.status, state.agent);
    }
    Ok(())
}
