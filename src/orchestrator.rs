//! Stage orchestration over metadata: init, handoff context, updates with
//! gating and validation, and status with staleness detection.
//!
//! Every mutating entry point runs load -> mutate -> save with the version
//! from the load, so concurrent updates surface as `VersionConflict` instead
//! of lost writes.
use crate::config::Config;
use crate::docs::{CLARIFY_END, CLARIFY_START, DEP_SIG_END, DEP_SIG_START};
use crate::error::CoreError;
use crate::metadata::{load_metadata, save_metadata};
use crate::requirement::{global_memory_hash, global_memory_path};
use crate::review::{final_check, ReviewIssue};
use crate::signature::{content_hash, current_doc_hashes, extract_signatures, stage_upstream_hashes};
use crate::stage::{
    downgrade_downstream, downgrade_from, ensure_subagent_state, recommended_next_stage,
    reopen_doc_stages_from,
    unmet_dependencies, MappedIssue, ReopenRecord, Stage, StageState, StageStatus, SubagentState,
    DOC_STAGES, STAGE_ORDER,
};
use crate::util::now_epoch_ms;
use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Section contract handed to the agent running a stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageHints {
    pub target_sections: Vec<String>,
    pub must_keep_sections: Vec<String>,
}

fn stage_hints(stage: Stage) -> StageHints {
    let marker_keeps = [CLARIFY_START, CLARIFY_END];
    let signed_keeps = [CLARIFY_START, CLARIFY_END, DEP_SIG_START, DEP_SIG_END];
    let (targets, keeps): (&[&str], Vec<&str>) = match stage {
        Stage::Analysis => (
            &[
                "## Original Requirement",
                "## Context Notes",
                "## Current State and Affected Modules",
                "## Requirement Coverage",
                "## Risks and Impact",
                "## Conclusion",
                "## Clarification Notes",
            ],
            ["## Original Requirement", "## Requirement Coverage"]
                .into_iter()
                .chain(marker_keeps)
                .collect(),
        ),
        Stage::Prd => (
            &[
                "## Scope and Boundaries",
                "## Summary",
                "## Feature Flows",
                "## Edge Cases and Failure Handling",
                "## Non-functional Requirements",
                "## Open Points",
            ],
            ["## Non-functional Requirements"]
                .into_iter()
                .chain(signed_keeps)
                .collect(),
        ),
        Stage::Tech => (
            &[
                "## Current State",
                "## Goals",
                "## Architecture",
                "## Data Model",
                "## Migration and Rollback",
                "## Notes",
            ],
            ["## Migration and Rollback"]
                .into_iter()
                .chain(signed_keeps)
                .collect(),
        ),
        Stage::Acceptance => (
            &[
                "## Acceptance Checklist",
                "## Acceptance Plan",
                "## Regression Scope",
            ],
            ["## Acceptance Checklist"]
                .into_iter()
                .chain(signed_keeps)
                .collect(),
        ),
        Stage::FinalCheck => (&[], Vec::new()),
    };
    StageHints {
        target_sections: targets.iter().map(|s| s.to_string()).collect(),
        must_keep_sections: keeps.into_iter().map(|s| s.to_string()).collect(),
    }
}

/// Initialize or repair the orchestration block in metadata.
pub fn init_subagent_state(
    req_dir: &Path,
    config: &Config,
    dry_run: bool,
    reset: bool,
) -> Result<SubagentState> {
    let (mut meta, version) = load_metadata(req_dir, config)?;
    let now = now_epoch_ms()?;
    let mut changed = ensure_subagent_state(&mut meta, reset, now);
    let mut root = meta.subagents.take().unwrap_or_default();
    let next = recommended_next_stage(&root.stages).unwrap_or(Stage::Analysis);
    if root.current_stage != next.as_str() {
        root.current_stage = next.as_str().to_string();
        changed = true;
    }
    meta.subagents = Some(root.clone());
    if changed {
        save_metadata(req_dir, &mut meta, version, config, dry_run)?;
    }
    Ok(root)
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamDoc {
    pub stage: String,
    pub path: String,
    pub hash: String,
    pub status: StageStatus,
    pub exists: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetDoc {
    pub path: String,
    pub exists: bool,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalMemoryInfo {
    pub path: String,
    pub exists: bool,
    pub hash: String,
}

/// Everything a stage agent needs to run one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageContext {
    pub requirement_path: String,
    pub stage: String,
    pub target_sections: Vec<String>,
    pub must_keep_sections: Vec<String>,
    pub reopen_reason: String,
    pub dependencies: Vec<String>,
    pub upstream_docs: Vec<UpstreamDoc>,
    pub target_doc: TargetDoc,
    pub dependency_signature_required: bool,
    pub project_mode: String,
    pub global_memory: GlobalMemoryInfo,
    pub handoff_protocol_version: u32,
    pub subagent_state: SubagentState,
}

pub fn stage_context(req_dir: &Path, config: &Config, stage: Stage) -> Result<StageContext> {
    let (mut meta, version) = load_metadata(req_dir, config)?;
    let now = now_epoch_ms()?;
    let changed = ensure_subagent_state(&mut meta, false, now);
    if changed {
        save_metadata(req_dir, &mut meta, version, config, false)?;
    }
    let root = meta.subagents.clone().unwrap_or_default();

    let upstream_hashes = stage_upstream_hashes(req_dir, stage)?;
    let mut upstream_docs = Vec::new();
    for dep in stage.dependencies() {
        let doc_path = dep.doc_file().map(|file| req_dir.join(file));
        upstream_docs.push(UpstreamDoc {
            stage: dep.as_str().to_string(),
            path: doc_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            hash: upstream_hashes.get(dep.as_str()).cloned().unwrap_or_default(),
            status: root.stage_state(*dep).status,
            exists: doc_path.as_ref().is_some_and(|p| p.exists()),
        });
    }

    let target_path = stage.doc_file().map(|file| req_dir.join(file));
    let target_exists = target_path.as_ref().is_some_and(|p| p.exists());
    let target_hash = match &target_path {
        Some(path) if target_exists => {
            crate::docs::read_doc_optional(path)?.map(|c| content_hash(&c)).unwrap_or_default()
        }
        _ => String::new(),
    };

    let state = root.stage_state(stage);
    let note = state.notes.trim().to_string();
    let mut reopen_reason = if note.to_ascii_lowercase().contains("reopen") {
        note
    } else {
        String::new()
    };
    if reopen_reason.is_empty() {
        if let Some(record) = &root.last_reopen {
            if record.stage == stage.as_str() {
                reopen_reason = record.reason.clone();
            }
        }
    }

    let hints = stage_hints(stage);
    let memory_path = global_memory_path(config);
    Ok(StageContext {
        requirement_path: req_dir.display().to_string(),
        stage: stage.as_str().to_string(),
        target_sections: hints.target_sections.clone(),
        must_keep_sections: hints.must_keep_sections.clone(),
        reopen_reason,
        dependencies: stage
            .dependencies()
            .iter()
            .map(|dep| dep.as_str().to_string())
            .collect(),
        upstream_docs,
        target_doc: TargetDoc {
            path: target_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            exists: target_exists,
            hash: target_hash,
        },
        dependency_signature_required: stage.requires_signature(),
        project_mode: meta.project_mode.clone(),
        global_memory: GlobalMemoryInfo {
            path: memory_path.display().to_string(),
            exists: memory_path.exists(),
            hash: global_memory_hash(config)?,
        },
        handoff_protocol_version: root.handoff_protocol_version,
        subagent_state: root,
    })
}

/// Validate a completed doc stage: presence, non-emptiness, and the embedded
/// dependency signatures against the current upstream hashes.
fn validate_doc_completion(
    req_dir: &Path,
    stage: Stage,
    upstream_hashes: &BTreeMap<String, String>,
) -> Result<(String, Vec<String>)> {
    let Some(file) = stage.doc_file() else {
        return Ok((String::new(), Vec::new()));
    };
    let Some(content) = crate::docs::read_doc_optional(&req_dir.join(file))? else {
        return Ok((String::new(), vec![format!("{file} missing")]));
    };
    if content.trim().is_empty() {
        return Ok((String::new(), vec![format!("{file} is empty")]));
    }
    let doc_hash = content_hash(&content);
    let mut issues = Vec::new();
    if stage.requires_signature() {
        let declared = extract_signatures(&content);
        for (dep, expected) in upstream_hashes {
            match declared.get(dep) {
                None => issues.push(format!("{file} missing dependency signature: {dep}")),
                Some(sig) if sig != expected => {
                    issues.push(format!("{file} dependency signature mismatch: {dep}"));
                }
                Some(_) => {}
            }
        }
    }
    Ok((doc_hash, issues))
}

/// Final check in no-write mode, folded into stage validation messages.
fn validate_final_check(req_dir: &Path, config: &Config) -> Result<Vec<String>> {
    let issues = final_check(req_dir, config, false)?;
    Ok(issues
        .iter()
        .map(|issue| format!("{}: {}", issue.doc, issue.question))
        .collect())
}

/// Map a review finding to the earliest doc stage that must rerun.
fn classify_issue(issue: &ReviewIssue) -> Stage {
    let code = issue.code.trim().to_ascii_lowercase();
    for stage in DOC_STAGES {
        if code.starts_with(&format!("{}.", stage.as_str())) {
            return stage;
        }
    }
    if code.starts_with("global.") {
        // Global findings usually need the analysis refreshed first.
        return Stage::Analysis;
    }
    if let Ok(stage) = Stage::parse(issue.doc.trim()) {
        if stage.is_doc_stage() {
            return stage;
        }
    }
    let question = issue.question.to_ascii_lowercase();
    if question.contains("acceptance") || issue.question.contains("A-") {
        return Stage::Acceptance;
    }
    if ["tech", "sql", "schema", "rollback", "migration"]
        .iter()
        .any(|k| question.contains(k))
    {
        return Stage::Tech;
    }
    if question.contains("prd") || question.contains("product") {
        return Stage::Prd;
    }
    Stage::Analysis
}

fn suggest_reopen(
    req_dir: &Path,
    config: &Config,
) -> Result<Option<(Stage, BTreeMap<String, usize>, Vec<MappedIssue>)>> {
    let raw_issues = final_check(req_dir, config, false)?;
    if raw_issues.is_empty() {
        return Ok(None);
    }
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut mapped = Vec::new();
    for issue in &raw_issues {
        let stage = classify_issue(issue);
        *counts.entry(stage.as_str().to_string()).or_default() += 1;
        mapped.push(MappedIssue {
            doc: issue.doc.clone(),
            question: issue.question.clone(),
            code: issue.code.clone(),
            mapped_stage: stage.as_str().to_string(),
        });
    }
    let reopen_stage = DOC_STAGES
        .into_iter()
        .find(|stage| counts.get(stage.as_str()).copied().unwrap_or(0) > 0);
    Ok(reopen_stage.map(|stage| (stage, counts, mapped)))
}

pub struct StageUpdate<'a> {
    pub stage: Stage,
    pub status: StageStatus,
    pub agent: &'a str,
    pub notes: &'a str,
    pub dry_run: bool,
    pub force: bool,
}

/// Record a stage transition, enforcing the dependency and output contracts.
pub fn update_stage(req_dir: &Path, config: &Config, update: &StageUpdate) -> Result<SubagentState> {
    let stage = update.stage;
    let status = update.status;
    let (mut meta, version) = load_metadata(req_dir, config)?;
    let now = now_epoch_ms()?;
    ensure_subagent_state(&mut meta, false, now);
    let mut root = meta.subagents.take().unwrap_or_default();

    if matches!(status, StageStatus::Running | StageStatus::Completed) {
        let blocked = unmet_dependencies(&root.stages, stage);
        if !blocked.is_empty() && !update.force {
            return Err(CoreError::DependencyBlocked {
                stage: stage.as_str().to_string(),
                reasons: blocked,
            }
            .into());
        }
    }

    let upstream_hashes = if status == StageStatus::Completed {
        stage_upstream_hashes(req_dir, stage)?
    } else {
        BTreeMap::new()
    };
    let mut doc_hash = String::new();
    let mut validation_errors = Vec::new();
    if status == StageStatus::Completed {
        if stage.is_doc_stage() {
            let (hash, errors) = validate_doc_completion(req_dir, stage, &upstream_hashes)?;
            doc_hash = hash;
            validation_errors = errors;
        } else {
            validation_errors = validate_final_check(req_dir, config)?;
        }
        if !validation_errors.is_empty() && !update.force {
            return Err(CoreError::ValidationFailed {
                stage: stage.as_str().to_string(),
                reasons: validation_errors,
            }
            .into());
        }
    }

    let state = root
        .stages
        .entry(stage.as_str().to_string())
        .or_default();
    state.status = status;
    state.agent = update.agent.trim().to_string();
    state.updated_at_epoch_ms = now;
    state.doc_hash = doc_hash;
    state.upstream_hashes = upstream_hashes;
    state.notes = update.notes.trim().to_string();
    state.validation_errors = validation_errors;

    if stage == Stage::FinalCheck && status == StageStatus::Failed {
        match suggest_reopen(req_dir, config)? {
            Some((reopen_stage, counts, mapped)) => {
                let breakdown: Vec<String> = counts
                    .iter()
                    .filter(|(_, n)| **n > 0)
                    .map(|(stage, n)| format!("{stage}:{n}"))
                    .collect();
                let reason =
                    format!("auto reopen by final-check mapping ({})", breakdown.join(", "));
                reopen_doc_stages_from(&mut root.stages, reopen_stage, &reason, now);
                let issue_count = mapped.len();
                root.last_reopen = Some(ReopenRecord {
                    stage: reopen_stage.as_str().to_string(),
                    reason,
                    at_epoch_ms: now,
                    source: "final_check".to_string(),
                    issue_count,
                    breakdown: counts.into_iter().filter(|(_, n)| *n > 0).collect(),
                    issues: mapped.into_iter().take(20).collect(),
                });
            }
            None => {
                root.last_reopen = None;
            }
        }
    }

    // A reopened or failed upstream forces downstream reruns.
    if matches!(status, StageStatus::Pending | StageStatus::Failed) && stage != Stage::FinalCheck {
        downgrade_downstream(
            &mut root.stages,
            stage,
            &format!("upstream stage changed: {stage}"),
            now,
        );
    }

    // Completed doc stage: downstream completions recorded against older
    // upstream hashes are no longer trustworthy.
    if status == StageStatus::Completed && stage.is_doc_stage() {
        for downstream in STAGE_ORDER {
            if downstream == stage || !downstream.dependencies().contains(&stage) {
                continue;
            }
            let downstream_state = root.stage_state(downstream);
            if downstream_state.status != StageStatus::Completed {
                continue;
            }
            let expected = stage_upstream_hashes(req_dir, downstream)?;
            let drifted = expected.iter().any(|(dep, hash)| {
                downstream_state
                    .upstream_hashes
                    .get(dep)
                    .map(String::as_str)
                    .unwrap_or("")
                    != hash
            });
            if drifted {
                downgrade_from(
                    &mut root.stages,
                    downstream,
                    &format!("upstream content drifted: {stage}"),
                    now,
                );
                break;
            }
        }
    }

    root.current_stage = recommended_next_stage(&root.stages)
        .unwrap_or(Stage::FinalCheck)
        .as_str()
        .to_string();
    root.updated_at_epoch_ms = now;
    meta.subagents = Some(root.clone());
    save_metadata(req_dir, &mut meta, version, config, update.dry_run)?;
    Ok(root)
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub requirement_path: String,
    pub current_stage: String,
    pub stale_stages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reopen: Option<ReopenRecord>,
    pub stages: BTreeMap<String, StageState>,
}

/// Report stage state with staleness detection.
///
/// Read-only by default: stale completions are downgraded only in the
/// report. With `normalize` the downgrade is persisted.
pub fn stage_status(req_dir: &Path, config: &Config, normalize: bool) -> Result<StatusReport> {
    let (mut meta, version) = load_metadata(req_dir, config)?;
    let now = now_epoch_ms()?;
    let changed = ensure_subagent_state(&mut meta, false, now);
    let mut root = meta.subagents.take().unwrap_or_default();
    let current_hashes = current_doc_hashes(req_dir)?;

    let mut stale: BTreeMap<&'static str, bool> = BTreeMap::new();
    for stage in STAGE_ORDER {
        let state = root.stage_state(stage);
        if state.status != StageStatus::Completed {
            stale.insert(stage.as_str(), false);
            continue;
        }
        if stage.is_doc_stage() {
            let current_hash = current_hashes
                .get(stage.as_str())
                .map(String::as_str)
                .unwrap_or("");
            if state.doc_hash.is_empty() || state.doc_hash != current_hash {
                stale.insert(stage.as_str(), true);
                continue;
            }
            let current_up = stage_upstream_hashes(req_dir, stage)?;
            let drifted = current_up.iter().any(|(dep, hash)| {
                state.upstream_hashes.get(dep).map(String::as_str).unwrap_or("") != hash
            });
            stale.insert(stage.as_str(), drifted);
        } else {
            let blocked = stage.dependencies().iter().any(|dep| {
                stale.get(dep.as_str()).copied().unwrap_or(false)
                    || root.stage_state(*dep).status != StageStatus::Completed
            });
            stale.insert(stage.as_str(), blocked);
        }
    }

    let mut stale_changed = false;
    let mut effective = root.stages.clone();
    for stage in STAGE_ORDER {
        if !stale.get(stage.as_str()).copied().unwrap_or(false) {
            continue;
        }
        let state = effective.entry(stage.as_str().to_string()).or_default();
        if state.status != StageStatus::Pending {
            stale_changed = true;
        }
        state.status = StageStatus::Pending;
    }

    let current_stage = recommended_next_stage(&effective)
        .unwrap_or(Stage::FinalCheck)
        .as_str()
        .to_string();
    let stale_stages: Vec<String> = STAGE_ORDER
        .iter()
        .filter(|stage| stale.get(stage.as_str()).copied().unwrap_or(false))
        .map(|stage| stage.as_str().to_string())
        .collect();

    if normalize {
        root.stages = effective;
        root.current_stage = current_stage.clone();
        root.updated_at_epoch_ms = now;
        let report = StatusReport {
            requirement_path: req_dir.display().to_string(),
            current_stage,
            stale_stages,
            last_reopen: root.last_reopen.clone(),
            stages: root.stages.clone(),
        };
        let must_save = changed || stale_changed;
        meta.subagents = Some(root);
        if must_save {
            save_metadata(req_dir, &mut meta, version, config, false)?;
        }
        return Ok(report);
    }

    Ok(StatusReport {
        requirement_path: req_dir.display().to_string(),
        current_stage,
        stale_stages,
        last_reopen: root.last_reopen.clone(),
        stages: root.stages,
    })
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
