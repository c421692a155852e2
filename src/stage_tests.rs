use super::{
    downgrade_downstream, downgrade_from, ensure_subagent_state, recommended_next_stage,
    reopen_doc_stages_from,
    unmet_dependencies, Stage, StageState, StageStatus, SubagentState, HANDOFF_PROTOCOL_VERSION,
    STAGE_ORDER,
};
use crate::metadata::Metadata;
use std::collections::BTreeMap;

fn stages_with(completed: &[Stage]) -> BTreeMap<String, StageState> {
    let mut stages = BTreeMap::new();
    for stage in STAGE_ORDER {
        let status = if completed.contains(&stage) {
            StageStatus::Completed
        } else {
            StageStatus::Pending
        };
        stages.insert(
            stage.as_str().to_string(),
            StageState {
                status,
                ..StageState::default()
            },
        );
    }
    stages
}

#[test]
fn stage_parse_round_trips_and_rejects_garbage() {
    for stage in STAGE_ORDER {
        assert_eq!(Stage::parse(stage.as_str()).expect("parse"), stage);
    }
    assert_eq!(Stage::parse(" FINAL_CHECK ").expect("parse"), Stage::FinalCheck);
    assert!(Stage::parse("deploy").is_err());
}

#[test]
fn unknown_status_deserializes_as_pending() {
    let status: StageStatus = serde_json::from_str("\"archived\"").expect("deserialize");
    assert_eq!(status, StageStatus::Pending);
    let status: StageStatus = serde_json::from_str("\"Completed\"").expect("deserialize");
    assert_eq!(status, StageStatus::Completed);
}

#[test]
fn dependencies_form_the_fixed_chain() {
    assert!(Stage::Analysis.dependencies().is_empty());
    assert_eq!(Stage::Prd.dependencies(), &[Stage::Analysis]);
    assert_eq!(
        Stage::FinalCheck.dependencies(),
        &[Stage::Analysis, Stage::Prd, Stage::Tech, Stage::Acceptance]
    );
    assert!(Stage::FinalCheck.doc_file().is_none());
    assert!(!Stage::Analysis.requires_signature());
    assert!(Stage::Acceptance.requires_signature());
}

#[test]
fn ensure_creates_canonical_block() {
    let mut meta = Metadata::default();
    assert!(ensure_subagent_state(&mut meta, false, 42));
    let root = meta.subagents.as_ref().expect("subagents present");
    assert_eq!(root.stage_order.len(), 5);
    assert_eq!(root.current_stage, "analysis");
    assert_eq!(root.handoff_protocol_version, HANDOFF_PROTOCOL_VERSION);
    for stage in STAGE_ORDER {
        let state = root.stage_state(stage);
        assert_eq!(state.status, StageStatus::Pending);
        assert_eq!(state.updated_at_epoch_ms, 42);
    }
    // Second run over a canonical block only refreshes the timestamp.
    assert!(!ensure_subagent_state(&mut meta, false, 43));
}

#[test]
fn ensure_drops_unknown_stage_entries_and_repairs_current() {
    let mut meta = Metadata::default();
    let mut root = SubagentState {
        current_stage: "deploy".to_string(),
        ..SubagentState::default()
    };
    root.stages
        .insert("deploy".to_string(), StageState::default());
    meta.subagents = Some(root);

    assert!(ensure_subagent_state(&mut meta, false, 1));
    let root = meta.subagents.as_ref().expect("subagents present");
    assert!(!root.stages.contains_key("deploy"));
    assert_eq!(root.current_stage, "analysis");
}

#[test]
fn ensure_reset_discards_existing_progress() {
    let mut meta = Metadata::default();
    ensure_subagent_state(&mut meta, false, 1);
    if let Some(root) = meta.subagents.as_mut() {
        if let Some(state) = root.stages.get_mut("analysis") {
            state.status = StageStatus::Completed;
        }
    }
    ensure_subagent_state(&mut meta, true, 2);
    let root = meta.subagents.as_ref().expect("subagents present");
    assert_eq!(root.stage_state(Stage::Analysis).status, StageStatus::Pending);
}

#[test]
fn next_stage_walks_the_chain() {
    let stages = stages_with(&[]);
    assert_eq!(recommended_next_stage(&stages), Some(Stage::Analysis));

    let stages = stages_with(&[Stage::Analysis]);
    assert_eq!(recommended_next_stage(&stages), Some(Stage::Prd));

    let stages = stages_with(&[
        Stage::Analysis,
        Stage::Prd,
        Stage::Tech,
        Stage::Acceptance,
    ]);
    assert_eq!(recommended_next_stage(&stages), Some(Stage::FinalCheck));

    let stages = stages_with(&STAGE_ORDER);
    assert_eq!(recommended_next_stage(&stages), None);
}

#[test]
fn unmet_dependencies_name_each_missing_stage() {
    let stages = stages_with(&[Stage::Analysis]);
    let unmet = unmet_dependencies(&stages, Stage::Acceptance);
    assert_eq!(unmet.len(), 2);
    assert!(unmet[0].contains("prd"));
    assert!(unmet[1].contains("tech"));
}

#[test]
fn reopen_resets_target_and_later_doc_stages() {
    let mut stages = stages_with(&[
        Stage::Analysis,
        Stage::Prd,
        Stage::Tech,
        Stage::Acceptance,
    ]);
    if let Some(state) = stages.get_mut("tech") {
        state.doc_hash = "abc".to_string();
        state.notes = "done".to_string();
    }
    reopen_doc_stages_from(&mut stages, Stage::Prd, "reopened by final check", 7);

    assert_eq!(stages["analysis"].status, StageStatus::Completed);
    for name in ["prd", "tech", "acceptance"] {
        assert_eq!(stages[name].status, StageStatus::Pending, "{name}");
        assert_eq!(stages[name].updated_at_epoch_ms, 7, "{name}");
    }
    assert!(stages["tech"].doc_hash.is_empty());
    assert_eq!(stages["tech"].notes, "reopened by final check; done");
}

#[test]
fn downgrade_from_includes_the_stage_itself() {
    let mut stages = stages_with(&[Stage::Analysis, Stage::Prd, Stage::Tech]);
    downgrade_from(&mut stages, Stage::Prd, "stale against upstream", 5);
    assert_eq!(stages["analysis"].status, StageStatus::Completed);
    assert_eq!(stages["prd"].status, StageStatus::Pending);
    assert_eq!(stages["tech"].status, StageStatus::Pending);
}

#[test]
fn downgrade_skips_already_pending_stages() {
    let mut stages = stages_with(&[Stage::Analysis, Stage::Prd, Stage::Tech]);
    downgrade_downstream(&mut stages, Stage::Analysis, "upstream changed", 9);

    assert_eq!(stages["analysis"].status, StageStatus::Completed);
    assert_eq!(stages["prd"].status, StageStatus::Pending);
    assert_eq!(stages["tech"].status, StageStatus::Pending);
    // Stages already pending keep their (empty) notes.
    assert!(stages["acceptance"].notes.is_empty());
    assert_eq!(stages["prd"].notes, "upstream changed");
}
