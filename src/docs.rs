//! Fixed document set and block markers for a requirement directory.
//!
//! Document prose is produced by external collaborators; this module only
//! knows the file layout, the machine-managed block markers, and the skeletal
//! templates `init` lays down.
use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

pub const CLARIFICATIONS_FILE: &str = "00-clarifications.md";
pub const CLARIFICATIONS_JSON_FILE: &str = "00-clarifications.json";
pub const ANALYSIS_FILE: &str = "01-analysis.md";
pub const PRD_FILE: &str = "02-prd.md";
pub const TECH_FILE: &str = "03-tech.md";
pub const ACCEPTANCE_FILE: &str = "04-acceptance.md";

/// Volatile block: excluded from content hashes.
pub const CLARIFY_START: &str = "<!-- CLARIFICATIONS:START -->";
pub const CLARIFY_END: &str = "<!-- CLARIFICATIONS:END -->";
/// Machine-written declaration of the upstream hashes a doc was derived from.
pub const DEP_SIG_START: &str = "<!-- DEPENDENCY-SIGNATURE:START -->";
pub const DEP_SIG_END: &str = "<!-- DEPENDENCY-SIGNATURE:END -->";

/// Read a document, `Ok(None)` when it does not exist.
pub fn read_doc_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

/// Remove every clarification block (markers included) before hashing.
pub fn strip_clarification_block(content: &str) -> String {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        regex::Regex::new(&format!(
            "{}[\\s\\S]*?{}",
            regex::escape(CLARIFY_START),
            regex::escape(CLARIFY_END)
        ))
        .expect("static clarification pattern")
    });
    pattern.replace_all(content, "").into_owned()
}

pub fn clarifications_markdown(title: &str) -> String {
    format!(
        "# Clarifications - {title}\n\
         \n\
         ## Notes\n\
         - Record every point that needs user confirmation here.\n\
         - Allowed statuses: `open`, `confirmed`.\n\
         \n\
         ## Open Points\n\
         {CLARIFY_START}\n\
         - none yet\n\
         {CLARIFY_END}\n"
    )
}

pub fn clarifications_json() -> String {
    "{\n  \"rows\": []\n}\n".to_string()
}

pub fn analysis_markdown(title: &str, requirement: &str) -> String {
    format!(
        "# Analysis - {title}\n\
         \n\
         ## Original Requirement\n\
         {requirement}\n\
         \n\
         ## Context Notes\n\
         - TODO: modules, dependencies, roles, data sources.\n\
         \n\
         ## Current State and Affected Modules\n\
         - TODO\n\
         \n\
         ## Requirement Coverage\n\
         - R-1: TODO\n\
         \n\
         ## Risks and Impact\n\
         - TODO\n\
         \n\
         ## Conclusion\n\
         - TODO\n\
         \n\
         ## Clarification Notes\n\
         {CLARIFY_START}\n\
         - none yet\n\
         {CLARIFY_END}\n"
    )
}

pub fn prd_markdown(title: &str) -> String {
    downstream_markdown("PRD", title, &["## Scope and Boundaries", "## Summary", "## Feature Flows", "## Edge Cases and Failure Handling", "## Non-functional Requirements", "## Open Points"])
}

pub fn tech_markdown(title: &str) -> String {
    downstream_markdown("Tech Plan", title, &["## Current State", "## Goals", "## Architecture", "## Data Model", "## Migration and Rollback", "## Notes"])
}

pub fn acceptance_markdown(title: &str) -> String {
    downstream_markdown("Acceptance", title, &["## Acceptance Checklist", "## Acceptance Plan", "## Regression Scope"])
}

fn downstream_markdown(kind: &str, title: &str, sections: &[&str]) -> String {
    let mut out = format!("# {kind} - {title}\n");
    for section in sections {
        out.push_str(&format!("\n{section}\n- TODO\n"));
    }
    out.push_str(&format!(
        "\n## Clarification Notes\n{CLARIFY_START}\n- none yet\n{CLARIFY_END}\n\
         \n{DEP_SIG_START}\n{DEP_SIG_END}\n"
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_removes_block_and_markers() {
        let content = format!("before\n{CLARIFY_START}\nvolatile\n{CLARIFY_END}\nafter\n");
        let stripped = strip_clarification_block(&content);
        assert!(!stripped.contains("volatile"));
        assert!(!stripped.contains(CLARIFY_START));
        assert!(stripped.contains("before"));
        assert!(stripped.contains("after"));
    }

    #[test]
    fn strip_handles_multiple_blocks() {
        let content = format!(
            "a\n{CLARIFY_START}x{CLARIFY_END}\nb\n{CLARIFY_START}y{CLARIFY_END}\nc"
        );
        let stripped = strip_clarification_block(&content);
        assert!(!stripped.contains('x'));
        assert!(!stripped.contains('y'));
        assert!(stripped.contains('b'));
    }

    #[test]
    fn downstream_templates_carry_signature_markers() {
        let prd = prd_markdown("Sample");
        assert!(prd.contains(DEP_SIG_START));
        assert!(prd.contains(DEP_SIG_END));
        assert!(prd.contains("## Non-functional Requirements"));
    }
}
