//! Final review over a requirement's document chain.
//!
//! Read-only by default; `write_back` lets the freshness engine persist
//! refreshed dependency snapshots. Issue codes are dot-scoped
//! (`<doc>.<area>.<detail>`) so the orchestrator can classify them back onto
//! stages by prefix.
use crate::config::Config;
use crate::docs;
use crate::error::CoreError;
use crate::metadata::{load_metadata, save_metadata, Metadata};
use crate::requirement::global_memory_hash;
use crate::signature::check_freshness;
use crate::stage::DOC_STAGES;
use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewIssue {
    pub doc: String,
    pub question: String,
    pub code: String,
    pub needs_clarification: bool,
}

fn needs_clarification(code: &str) -> bool {
    // Orphan requirement IDs usually mean the requirement itself is disputed.
    code == "acceptance.traceability.orphan_rids"
}

fn issue(doc: &str, question: impl Into<String>, code: impl Into<String>) -> ReviewIssue {
    let code = code.into();
    ReviewIssue {
        doc: doc.to_string(),
        question: question.into(),
        needs_clarification: needs_clarification(&code),
        code,
    }
}

fn requirement_ids(content: &str) -> BTreeSet<String> {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| regex::Regex::new(r"\bR-\d+\b").expect("static requirement id pattern"));
    pattern
        .find_iter(content)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Run every check and return the findings, empty when the chain is clean.
pub fn final_check(req_dir: &Path, config: &Config, write_back: bool) -> Result<Vec<ReviewIssue>> {
    let mut issues = Vec::new();

    // Metadata may be absent on a hand-built directory; checks that do not
    // need it still run.
    let loaded = match load_metadata(req_dir, config) {
        Ok(loaded) => Some(loaded),
        Err(err) if matches!(err.downcast_ref::<CoreError>(), Some(CoreError::NotFound(_))) => None,
        Err(err) => return Err(err),
    };
    let has_metadata = loaded.is_some();
    let (mut meta, version) = loaded.unwrap_or_else(|| (Metadata::default(), 0));

    let current_memory_hash = global_memory_hash(config)?;
    if meta.global_memory_hash != current_memory_hash {
        issues.push(issue(
            "global",
            "global memory snapshot is out of date, run sync-memory and re-check",
            "global.memory.unsynced",
        ));
    }

    // Presence, emptiness, placeholders.
    let mut stripped_contents = std::collections::BTreeMap::new();
    for stage in DOC_STAGES {
        let name = stage.as_str();
        let file = stage.doc_file().unwrap_or_default();
        let Some(content) = docs::read_doc_optional(&req_dir.join(file))? else {
            issues.push(issue(
                name,
                format!("{file} is missing, generate it first"),
                format!("{name}.doc.missing"),
            ));
            continue;
        };
        if content.trim().is_empty() {
            issues.push(issue(
                name,
                format!("{file} is empty"),
                format!("{name}.content.empty"),
            ));
            continue;
        }
        let stripped = docs::strip_clarification_block(&content);
        if let Some(token) = config
            .placeholders
            .iter()
            .find(|token| stripped.contains(token.as_str()))
        {
            issues.push(issue(
                name,
                format!("{file} still contains placeholder content ({token})"),
                format!("{name}.content.placeholder"),
            ));
        }
        stripped_contents.insert(name, stripped);
    }

    // Requirement-ID traceability down the chain.
    let analysis_rids = stripped_contents
        .get("analysis")
        .map(|content| requirement_ids(content))
        .unwrap_or_default();
    if !analysis_rids.is_empty() {
        let rids_of = |name: &str| {
            stripped_contents
                .get(name)
                .map(|content| requirement_ids(content))
                .unwrap_or_default()
        };
        let prd_rids = rids_of("prd");
        let tech_rids = rids_of("tech");
        let acc_rids = rids_of("acceptance");
        for (name, rids) in [("prd", &prd_rids), ("tech", &tech_rids)] {
            if analysis_rids.difference(rids).next().is_some() {
                issues.push(issue(
                    name,
                    format!(
                        "{name} doc does not cover every requirement ID from the analysis doc"
                    ),
                    format!("{name}.traceability.missing_analysis_rids"),
                ));
            }
        }
        if analysis_rids.difference(&acc_rids).next().is_some() {
            issues.push(issue(
                "acceptance",
                "acceptance doc does not cover every requirement ID from the analysis doc",
                "acceptance.traceability.missing_analysis_rids",
            ));
        }
        if prd_rids.difference(&acc_rids).next().is_some() {
            issues.push(issue(
                "acceptance",
                "acceptance doc does not cover every requirement ID from the prd doc",
                "acceptance.traceability.missing_prd_rids",
            ));
        }
        if tech_rids.difference(&acc_rids).next().is_some() {
            issues.push(issue(
                "acceptance",
                "acceptance doc does not cover every requirement ID from the tech doc",
                "acceptance.traceability.missing_tech_rids",
            ));
        }
        if acc_rids.difference(&analysis_rids).next().is_some() {
            issues.push(issue(
                "acceptance",
                "acceptance doc references requirement IDs the analysis doc never defines",
                "acceptance.traceability.orphan_rids",
            ));
        }
    }

    // Dependency freshness; snapshot refreshes only persist on write_back.
    let (freshness_issues, snapshot_changed) = check_freshness(req_dir, &mut meta)?;
    for finding in freshness_issues {
        let name = finding.stage.as_str();
        issues.push(issue(
            name,
            finding.message.clone(),
            format!("{name}.{}", finding.kind.code_suffix()),
        ));
    }
    if write_back && snapshot_changed && has_metadata {
        save_metadata(req_dir, &mut meta, version, config, false)?;
    }

    Ok(issues)
}

#[cfg(test)]
#[path = "review_tests.rs"]
mod tests;
