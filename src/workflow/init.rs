//! `init`: create a requirement folder with exactly-one-winner semantics.
use super::{lock_requirement, CommandContext};
use crate::cli::InitArgs;
use crate::config::ProjectMode;
use crate::docs;
use crate::error::CoreError;
use crate::metadata::{write_initial_metadata, Metadata};
use crate::output::emit;
use crate::requirement::{
    auto_requirement_name, auto_requirement_title, global_memory_hash, global_memory_path,
    next_available_name, requirement_dir, set_active,
};
use crate::util::{now_epoch_ms, utc_date_string, write_atomic};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

#[derive(Serialize)]
struct InitOutcome {
    path: String,
    name: String,
    title: String,
    project_mode: String,
    state_only: bool,
    auto_named: bool,
}

fn requirement_text(args: &InitArgs) -> Result<String> {
    let text = match (&args.text, &args.file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("read requirement text from {}", path.display()))?,
        (None, None) => {
            return Err(
                CoreError::InvalidInput("provide the requirement via --text or --file".to_string())
                    .into(),
            );
        }
    };
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(CoreError::InvalidInput("requirement text cannot be empty".to_string()).into());
    }
    Ok(text)
}

fn write_documents(req_dir: &Path, title: &str, requirement: &str) -> Result<()> {
    let files = [
        (docs::CLARIFICATIONS_FILE, docs::clarifications_markdown(title)),
        (docs::CLARIFICATIONS_JSON_FILE, docs::clarifications_json()),
        (docs::ANALYSIS_FILE, docs::analysis_markdown(title, requirement)),
        (docs::PRD_FILE, docs::prd_markdown(title)),
        (docs::TECH_FILE, docs::tech_markdown(title)),
        (docs::ACCEPTANCE_FILE, docs::acceptance_markdown(title)),
    ];
    for (file, content) in files {
        write_atomic(&req_dir.join(file), &content)?;
    }
    Ok(())
}

pub fn run_init(ctx: &CommandContext, args: &InitArgs) -> Result<()> {
    let text = requirement_text(args)?;
    let date = match args.date.as_deref().map(str::trim) {
        Some(date) if !date.is_empty() => date.to_string(),
        _ => utc_date_string()?,
    };
    let requested = args
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());
    let base_name = match requested {
        Some(name) => name.to_string(),
        None => auto_requirement_name(args.title.as_deref(), &text)?,
    };
    let project_mode = match args.project_mode.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => raw.parse::<ProjectMode>()?,
        _ => ctx.config.default_project_mode,
    };

    if ctx.dry_run {
        let name = if requested.is_some() {
            base_name.clone()
        } else {
            next_available_name(&ctx.config, &date, &base_name)
        };
        let path = requirement_dir(&ctx.config, &date, &name);
        tracing::info!(path = %path.display(), "dry-run: would initialize requirement");
        return emit(
            ctx.json,
            &format!("dry-run: would initialize {}", path.display()),
            &InitOutcome {
                path: path.display().to_string(),
                name,
                title: auto_requirement_title(args.title.as_deref(), &text, &base_name),
                project_mode: project_mode.as_str().to_string(),
                state_only: args.state_only,
                auto_named: requested.is_none(),
            },
        );
    }

    let mut name = base_name.clone();
    let (path, title) = loop {
        let path = requirement_dir(&ctx.config, &date, &name);
        let guard = lock_requirement(ctx, &path)?;
        if path.exists() {
            guard.release();
            if requested.is_some() {
                return Err(CoreError::AlreadyExists { path }.into());
            }
            name = next_available_name(&ctx.config, &date, &base_name);
            continue;
        }
        let created = create_requirement_dir(&path)?;
        if !created {
            // Lost a race outside the lock protocol; pick the next name.
            guard.release();
            if requested.is_some() {
                return Err(CoreError::AlreadyExists { path }.into());
            }
            name = next_available_name(&ctx.config, &date, &base_name);
            continue;
        }

        let title = auto_requirement_title(args.title.as_deref(), &text, &name);
        let mut meta = Metadata {
            name: name.clone(),
            title: title.clone(),
            created_at_epoch_ms: now_epoch_ms()?,
            original_requirement: text.clone(),
            project_mode: project_mode.as_str().to_string(),
            initial_clarifications: args.clarify.clone().unwrap_or_default(),
            global_memory_hash: global_memory_hash(&ctx.config)?,
            global_memory_exists: global_memory_path(&ctx.config).exists(),
            ..Metadata::default()
        };
        write_initial_metadata(&path, &mut meta)?;
        if !args.state_only {
            write_documents(&path, &title, &text)?;
        }
        guard.release();
        break (path, title);
    };

    set_active(&ctx.config, &path)?;
    emit(
        ctx.json,
        &format!("initialized: {}", path.display()),
        &InitOutcome {
            path: path.display().to_string(),
            name,
            title,
            project_mode: project_mode.as_str().to_string(),
            state_only: args.state_only,
            auto_named: requested.is_none(),
        },
    )
}

/// `create_dir` is the atomic claim on the name: under races exactly one
/// creator succeeds.
fn create_requirement_dir(path: &Path) -> Result<bool> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    match fs::create_dir(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("create {}", path.display())),
    }
}

#[cfg(test)]
#[path = "init_tests.rs"]
mod tests;
