use super::final_check;
use crate::config::Config;
use crate::docs::{ACCEPTANCE_FILE, ANALYSIS_FILE, PRD_FILE, TECH_FILE};
use crate::metadata::{load_metadata, write_initial_metadata, Metadata};
use crate::requirement::{global_memory_hash, global_memory_path};
use crate::signature::{content_hash, render_signature_block};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

fn config_in(dir: &Path) -> Config {
    Config {
        spec_dir: dir.join("spec"),
        ..Config::default()
    }
}

fn signed(body: &str, upstream: &[(&str, &str)]) -> String {
    let hashes: BTreeMap<String, String> = upstream
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    format!("{body}\n{}", render_signature_block(&hashes))
}

/// Lay down a consistent requirement: synced memory, full chain, matching
/// signatures, every requirement ID covered.
fn clean_requirement(config: &Config) -> PathBuf {
    let dir = config.spec_dir.join("2026-08-29").join("export");
    std::fs::create_dir_all(&dir).expect("create requirement dir");
    std::fs::write(
        global_memory_path(config),
        "rule: exports must be idempotent\n",
    )
    .expect("write memory");

    let analysis = "# Analysis\n- R-1: export orders\n- R-2: schedule runs\n";
    std::fs::write(dir.join(ANALYSIS_FILE), analysis).expect("write analysis");
    let a_hash = content_hash(analysis);

    let prd = signed("# PRD\n- covers R-1 and R-2\n", &[("analysis", &a_hash)]);
    std::fs::write(dir.join(PRD_FILE), &prd).expect("write prd");
    let p_hash = content_hash(&prd);

    let tech = signed(
        "# Tech\n- design for R-1, R-2\n",
        &[("analysis", &a_hash), ("prd", &p_hash)],
    );
    std::fs::write(dir.join(TECH_FILE), &tech).expect("write tech");
    let t_hash = content_hash(&tech);

    let acceptance = signed(
        "# Acceptance\n- verify R-1\n- verify R-2\n",
        &[("analysis", &a_hash), ("prd", &p_hash), ("tech", &t_hash)],
    );
    std::fs::write(dir.join(ACCEPTANCE_FILE), &acceptance).expect("write acceptance");

    let mut meta = Metadata {
        name: "export".to_string(),
        global_memory_hash: global_memory_hash(config).expect("memory hash"),
        global_memory_exists: true,
        ..Metadata::default()
    };
    write_initial_metadata(&dir, &mut meta).expect("initial metadata");
    dir
}

fn codes(issues: &[super::ReviewIssue]) -> Vec<&str> {
    issues.iter().map(|i| i.code.as_str()).collect()
}

#[test]
fn clean_chain_passes() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = config_in(tmp.path());
    let dir = clean_requirement(&config);
    let issues = final_check(&dir, &config, false).expect("check");
    assert!(issues.is_empty(), "unexpected issues: {issues:?}");
}

#[test]
fn missing_doc_and_unsynced_memory_are_reported() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = config_in(tmp.path());
    let dir = clean_requirement(&config);
    std::fs::remove_file(dir.join(TECH_FILE)).expect("remove tech");
    std::fs::write(global_memory_path(&config), "rule: changed\n").expect("mutate memory");

    let issues = final_check(&dir, &config, false).expect("check");
    let codes = codes(&issues);
    assert!(codes.contains(&"global.memory.unsynced"));
    assert!(codes.contains(&"tech.doc.missing"));
}

#[test]
fn placeholder_tokens_are_flagged() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = config_in(tmp.path());
    let dir = clean_requirement(&config);
    let prd = std::fs::read_to_string(dir.join(PRD_FILE)).expect("read prd");
    std::fs::write(dir.join(PRD_FILE), format!("{prd}\n- TBD: flows\n")).expect("write prd");

    let issues = final_check(&dir, &config, false).expect("check");
    assert!(codes(&issues).contains(&"prd.content.placeholder"));
}

#[test]
fn traceability_gaps_and_orphans_are_reported() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = config_in(tmp.path());
    let dir = clean_requirement(&config);
    // Acceptance drops R-2 and invents R-9.
    let acceptance = std::fs::read_to_string(dir.join(ACCEPTANCE_FILE)).expect("read");
    let acceptance = acceptance
        .replace("- verify R-2\n", "")
        .replace("- verify R-1\n", "- verify R-1\n- verify R-9\n");
    std::fs::write(dir.join(ACCEPTANCE_FILE), acceptance).expect("write");

    let issues = final_check(&dir, &config, false).expect("check");
    let codes = codes(&issues);
    assert!(codes.contains(&"acceptance.traceability.missing_analysis_rids"));
    assert!(codes.contains(&"acceptance.traceability.orphan_rids"));
    let orphan = issues
        .iter()
        .find(|i| i.code == "acceptance.traceability.orphan_rids")
        .expect("orphan issue");
    assert!(orphan.needs_clarification);
}

#[test]
fn upstream_drift_surfaces_dependency_issues() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = config_in(tmp.path());
    let dir = clean_requirement(&config);
    // Record clean snapshots, then mutate analysis without regenerating.
    final_check(&dir, &config, true).expect("first check");
    std::fs::write(
        dir.join(ANALYSIS_FILE),
        "# Analysis\n- R-1: export orders\n- R-2: schedule runs\n- late change\n",
    )
    .expect("mutate analysis");

    let issues = final_check(&dir, &config, false).expect("second check");
    let codes = codes(&issues);
    assert!(codes.contains(&"prd.dependency.signature_mismatch"));
    assert!(codes.contains(&"prd.dependency.stale_downstream"));
}

#[test]
fn write_back_persists_dependency_snapshots() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = config_in(tmp.path());
    let dir = clean_requirement(&config);

    // Read-only run must not move the metadata version.
    final_check(&dir, &config, false).expect("read-only check");
    let (_, version) = load_metadata(&dir, &config).expect("load");
    assert_eq!(version, 1);

    final_check(&dir, &config, true).expect("write-back check");
    let (meta, version) = load_metadata(&dir, &config).expect("reload");
    assert_eq!(version, 2);
    assert!(meta.dependency_state.contains_key("prd"));
    assert!(meta.dependency_state.contains_key("acceptance"));
}
