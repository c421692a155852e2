//! Stage state machine types and pure helpers.
//!
//! Five fixed stages with a static dependency table; the orchestrator layers
//! filesystem and metadata access on top of these.
use crate::docs;
use crate::error::CoreError;
use crate::metadata::Metadata;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Analysis,
    Prd,
    Tech,
    Acceptance,
    FinalCheck,
}

/// Fixed execution order.
pub const STAGE_ORDER: [Stage; 5] = [
    Stage::Analysis,
    Stage::Prd,
    Stage::Tech,
    Stage::Acceptance,
    Stage::FinalCheck,
];

/// Document-producing stages, in reopen order.
pub const DOC_STAGES: [Stage; 4] = [Stage::Analysis, Stage::Prd, Stage::Tech, Stage::Acceptance];

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Analysis => "analysis",
            Stage::Prd => "prd",
            Stage::Tech => "tech",
            Stage::Acceptance => "acceptance",
            Stage::FinalCheck => "final_check",
        }
    }

    pub fn parse(raw: &str) -> Result<Stage> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "analysis" => Ok(Stage::Analysis),
            "prd" => Ok(Stage::Prd),
            "tech" => Ok(Stage::Tech),
            "acceptance" => Ok(Stage::Acceptance),
            "final_check" => Ok(Stage::FinalCheck),
            other => Err(CoreError::InvalidInput(format!(
                "invalid stage: {other} (allowed: analysis, prd, tech, acceptance, final_check)"
            ))
            .into()),
        }
    }

    /// Static dependency DAG.
    pub fn dependencies(self) -> &'static [Stage] {
        match self {
            Stage::Analysis => &[],
            Stage::Prd => &[Stage::Analysis],
            Stage::Tech => &[Stage::Analysis, Stage::Prd],
            Stage::Acceptance => &[Stage::Analysis, Stage::Prd, Stage::Tech],
            Stage::FinalCheck => &[Stage::Analysis, Stage::Prd, Stage::Tech, Stage::Acceptance],
        }
    }

    /// Relative document path for document-producing stages.
    pub fn doc_file(self) -> Option<&'static str> {
        match self {
            Stage::Analysis => Some(docs::ANALYSIS_FILE),
            Stage::Prd => Some(docs::PRD_FILE),
            Stage::Tech => Some(docs::TECH_FILE),
            Stage::Acceptance => Some(docs::ACCEPTANCE_FILE),
            Stage::FinalCheck => None,
        }
    }

    pub fn is_doc_stage(self) -> bool {
        self.doc_file().is_some()
    }

    /// Downstream docs must embed a dependency signature for their upstreams.
    pub fn requires_signature(self) -> bool {
        matches!(self, Stage::Prd | Stage::Tech | Stage::Acceptance)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<StageStatus> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(StageStatus::Pending),
            "running" => Ok(StageStatus::Running),
            "completed" => Ok(StageStatus::Completed),
            "failed" => Ok(StageStatus::Failed),
            other => Err(CoreError::InvalidInput(format!(
                "invalid status: {other} (allowed: completed, failed, pending, running)"
            ))
            .into()),
        }
    }
}

// Records written by other tools may carry unknown statuses; readers treat
// them as the pending default rather than failing the whole load.
impl From<String> for StageStatus {
    fn from(raw: String) -> Self {
        StageStatus::parse(&raw).unwrap_or_default()
    }
}

impl From<StageStatus> for String {
    fn from(status: StageStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    #[serde(default)]
    pub status: StageStatus,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub updated_at_epoch_ms: u128,
    /// Content hash of the stage document recorded at completion.
    #[serde(default)]
    pub doc_hash: String,
    /// Upstream content hashes the stage was completed against.
    #[serde(default)]
    pub upstream_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub validation_errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedIssue {
    pub doc: String,
    pub question: String,
    pub code: String,
    pub mapped_stage: String,
}

/// Record of the most recent automatic reopen, kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReopenRecord {
    pub stage: String,
    pub reason: String,
    pub at_epoch_ms: u128,
    pub source: String,
    pub issue_count: usize,
    pub breakdown: BTreeMap<String, usize>,
    pub issues: Vec<MappedIssue>,
}

pub const HANDOFF_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentState {
    #[serde(default)]
    pub stage_order: Vec<String>,
    #[serde(default)]
    pub stages: BTreeMap<String, StageState>,
    #[serde(default)]
    pub current_stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reopen: Option<ReopenRecord>,
    #[serde(default = "default_handoff_version")]
    pub handoff_protocol_version: u32,
    #[serde(default)]
    pub updated_at_epoch_ms: u128,
}

fn default_handoff_version() -> u32 {
    HANDOFF_PROTOCOL_VERSION
}

impl Default for SubagentState {
    fn default() -> Self {
        SubagentState {
            stage_order: Vec::new(),
            stages: BTreeMap::new(),
            current_stage: String::new(),
            last_reopen: None,
            handoff_protocol_version: HANDOFF_PROTOCOL_VERSION,
            updated_at_epoch_ms: 0,
        }
    }
}

impl SubagentState {
    pub fn stage_state(&self, stage: Stage) -> StageState {
        self.stages.get(stage.as_str()).cloned().unwrap_or_default()
    }
}

/// Repair the subagent block in-place to the canonical shape; returns whether
/// anything changed. `reset` discards existing stage states.
pub fn ensure_subagent_state(meta: &mut Metadata, reset: bool, now_ms: u128) -> bool {
    let mut changed = false;
    let mut root = match meta.subagents.take() {
        Some(root) if !reset => root,
        _ => {
            changed = true;
            SubagentState::default()
        }
    };

    let expected_order: Vec<String> = STAGE_ORDER
        .iter()
        .map(|stage| stage.as_str().to_string())
        .collect();
    if root.stage_order != expected_order {
        root.stage_order = expected_order;
        changed = true;
    }

    for stage in STAGE_ORDER {
        let entry = root.stages.entry(stage.as_str().to_string()).or_insert_with(|| {
            changed = true;
            StageState::default()
        });
        let before = entry.clone();
        entry.agent = entry.agent.trim().to_string();
        entry.notes = entry.notes.trim().to_string();
        entry.doc_hash = entry.doc_hash.trim().to_string();
        if entry.updated_at_epoch_ms == 0 {
            entry.updated_at_epoch_ms = now_ms;
        }
        if *entry != before {
            changed = true;
        }
    }
    // Drop stage entries that are not part of the fixed order.
    let known: Vec<String> = root.stages.keys().cloned().collect();
    for key in known {
        if Stage::parse(&key).is_err() {
            root.stages.remove(&key);
            changed = true;
        }
    }

    if Stage::parse(&root.current_stage).is_err() {
        root.current_stage = Stage::Analysis.as_str().to_string();
        changed = true;
    }
    if root.handoff_protocol_version != HANDOFF_PROTOCOL_VERSION {
        root.handoff_protocol_version = HANDOFF_PROTOCOL_VERSION;
        changed = true;
    }
    root.updated_at_epoch_ms = now_ms;
    meta.subagents = Some(root);
    changed
}

/// Earliest stage whose dependencies are all completed and which itself is not
/// completed; `None` when everything is done.
pub fn recommended_next_stage(stages: &BTreeMap<String, StageState>) -> Option<Stage> {
    for stage in STAGE_ORDER {
        let status = stages
            .get(stage.as_str())
            .map(|state| state.status)
            .unwrap_or_default();
        if status == StageStatus::Completed {
            continue;
        }
        if unmet_dependencies(stages, stage).is_empty() {
            return Some(stage);
        }
    }
    None
}

/// Dependency stages of `stage` that are not completed.
pub fn unmet_dependencies(stages: &BTreeMap<String, StageState>, stage: Stage) -> Vec<String> {
    stage
        .dependencies()
        .iter()
        .filter(|dep| {
            stages
                .get(dep.as_str())
                .map(|state| state.status != StageStatus::Completed)
                .unwrap_or(true)
        })
        .map(|dep| format!("dependency stage not completed: {dep}"))
        .collect()
}

/// Force `from` and every later doc stage back to pending, prepending the
/// reason to their notes.
pub fn reopen_doc_stages_from(
    stages: &mut BTreeMap<String, StageState>,
    from: Stage,
    reason: &str,
    now_ms: u128,
) {
    let mut started = false;
    for stage in DOC_STAGES {
        if stage == from {
            started = true;
        }
        if !started {
            continue;
        }
        if let Some(state) = stages.get_mut(stage.as_str()) {
            reset_to_pending(state, reason, now_ms);
        }
    }
}

/// Mark `stage` and every stage after it as pending (skipping ones already
/// pending).
pub fn downgrade_from(
    stages: &mut BTreeMap<String, StageState>,
    stage: Stage,
    reason: &str,
    now_ms: u128,
) {
    if let Some(state) = stages.get_mut(stage.as_str()) {
        if state.status != StageStatus::Pending {
            reset_to_pending(state, reason, now_ms);
        }
    }
    downgrade_downstream(stages, stage, reason, now_ms);
}

/// Mark every stage after `stage` as pending (skipping ones already pending).
pub fn downgrade_downstream(
    stages: &mut BTreeMap<String, StageState>,
    stage: Stage,
    reason: &str,
    now_ms: u128,
) {
    let Some(idx) = STAGE_ORDER.iter().position(|s| *s == stage) else {
        return;
    };
    for downstream in &STAGE_ORDER[idx + 1..] {
        let Some(state) = stages.get_mut(downstream.as_str()) else {
            continue;
        };
        if state.status == StageStatus::Pending {
            continue;
        }
        reset_to_pending(state, reason, now_ms);
    }
}

fn reset_to_pending(state: &mut StageState, reason: &str, now_ms: u128) {
    state.status = StageStatus::Pending;
    state.updated_at_epoch_ms = now_ms;
    state.doc_hash.clear();
    state.upstream_hashes.clear();
    state.validation_errors.clear();
    let old_notes = state.notes.trim();
    state.notes = if old_notes.is_empty() {
        reason.to_string()
    } else {
        format!("{reason}; {old_notes}")
    };
}

#[cfg(test)]
#[path = "stage_tests.rs"]
mod tests;
