//! Content hashing and dependency signature tracking.
//!
//! Each downstream doc carries a machine-written signature block declaring the
//! upstream hashes it was derived from. Freshness is decided by comparing
//! those declarations, the current doc hashes, and the last snapshot stored in
//! metadata.
use crate::docs::{self, DEP_SIG_END, DEP_SIG_START};
use crate::metadata::{DependencySnapshot, Metadata};
use crate::stage::{Stage, DOC_STAGES};
use crate::util::sha256_hex;
use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Stable hash of a document, ignoring clarification block volatility.
pub fn content_hash(content: &str) -> String {
    sha256_hex(docs::strip_clarification_block(content).as_bytes())
}

/// Parse `- <stage>: <hash>` lines out of the signature block. Absent block or
/// malformed lines yield an empty/partial map, never an error.
pub fn extract_signatures(content: &str) -> BTreeMap<String, String> {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        regex::Regex::new(&format!(
            "{}\\n?([\\s\\S]*?)\\n?{}",
            regex::escape(DEP_SIG_START),
            regex::escape(DEP_SIG_END)
        ))
        .expect("static signature pattern")
    });
    let mut out = BTreeMap::new();
    let Some(captures) = pattern.captures(content) else {
        return out;
    };
    let body = captures.get(1).map(|m| m.as_str()).unwrap_or("");
    for raw in body.lines() {
        let line = raw.trim().trim_start_matches('-').trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim().to_string();
        if !key.is_empty() && !value.is_empty() {
            out.insert(key, value);
        }
    }
    out
}

/// Render the block a downstream doc must embed for the given upstreams.
pub fn render_signature_block(upstream_hashes: &BTreeMap<String, String>) -> String {
    let mut out = String::from(DEP_SIG_START);
    out.push('\n');
    for (stage, hash) in upstream_hashes {
        out.push_str(&format!("- {stage}: {hash}\n"));
    }
    out.push_str(DEP_SIG_END);
    out.push('\n');
    out
}

/// Current hash of every doc that exists, keyed by stage name.
pub fn current_doc_hashes(req_dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut hashes = BTreeMap::new();
    for stage in DOC_STAGES {
        let Some(file) = stage.doc_file() else {
            continue;
        };
        if let Some(content) = docs::read_doc_optional(&req_dir.join(file))? {
            hashes.insert(stage.as_str().to_string(), content_hash(&content));
        }
    }
    Ok(hashes)
}

/// Upstream hash map a stage depends on, limited to docs that exist.
pub fn stage_upstream_hashes(req_dir: &Path, stage: Stage) -> Result<BTreeMap<String, String>> {
    let current = current_doc_hashes(req_dir)?;
    Ok(stage
        .dependencies()
        .iter()
        .filter_map(|dep| {
            current
                .get(dep.as_str())
                .map(|hash| (dep.as_str().to_string(), hash.clone()))
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessKind {
    MissingSignature,
    SignatureMismatch,
    StaleDownstream,
}

impl FreshnessKind {
    pub fn code_suffix(&self) -> &'static str {
        match self {
            FreshnessKind::MissingSignature => "dependency.missing_signature",
            FreshnessKind::SignatureMismatch => "dependency.signature_mismatch",
            FreshnessKind::StaleDownstream => "dependency.stale_downstream",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FreshnessIssue {
    pub stage: Stage,
    pub kind: FreshnessKind,
    pub message: String,
}

impl fmt::Display for FreshnessIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Walk the downstream docs and report freshness issues.
///
/// A doc with matching signatures and changed content gets its snapshot in
/// `meta.dependency_state` refreshed; the returned flag says whether the
/// caller must persist metadata. Docs whose upstream chain is incomplete are
/// skipped, presence is someone else's check.
pub fn check_freshness(req_dir: &Path, meta: &mut Metadata) -> Result<(Vec<FreshnessIssue>, bool)> {
    let doc_hashes = current_doc_hashes(req_dir)?;
    let mut issues = Vec::new();
    let mut changed = false;

    for stage in DOC_STAGES {
        if !stage.requires_signature() {
            continue;
        }
        let name = stage.as_str();
        let Some(doc_hash) = doc_hashes.get(name) else {
            continue;
        };
        let upstreams = stage.dependencies();
        if upstreams.iter().any(|up| !doc_hashes.contains_key(up.as_str())) {
            continue;
        }
        let current_up: BTreeMap<String, String> = upstreams
            .iter()
            .map(|up| (up.as_str().to_string(), doc_hashes[up.as_str()].clone()))
            .collect();

        let file = stage.doc_file().unwrap_or_default();
        let raw = docs::read_doc_optional(&req_dir.join(file))?.unwrap_or_default();
        let declared = extract_signatures(&raw);
        let has_all = upstreams.iter().all(|up| declared.contains_key(up.as_str()));
        let matches = has_all
            && current_up
                .iter()
                .all(|(up, hash)| declared.get(up).is_some_and(|sig| sig == hash));

        if !has_all {
            issues.push(FreshnessIssue {
                stage,
                kind: FreshnessKind::MissingSignature,
                message: format!(
                    "{file} is missing its dependency signature block, add {DEP_SIG_START}/{DEP_SIG_END} with upstream hashes"
                ),
            });
        } else if !matches {
            issues.push(FreshnessIssue {
                stage,
                kind: FreshnessKind::SignatureMismatch,
                message: format!(
                    "{file} declares dependency signatures that differ from current upstream docs, regenerate it"
                ),
            });
        }

        let prev = meta.dependency_state.get(name).cloned().unwrap_or_default();
        if (prev.doc_hash.is_empty() || prev.doc_hash != *doc_hash) && matches {
            meta.dependency_state.insert(
                name.to_string(),
                DependencySnapshot {
                    doc_hash: doc_hash.clone(),
                    upstream_hashes: current_up,
                },
            );
            changed = true;
            continue;
        }

        // Doc unchanged since the snapshot: any upstream drift means staleness.
        let drifted = current_up.iter().any(|(up, hash)| {
            prev.upstream_hashes.get(up).map(String::as_str).unwrap_or("") != hash
        });
        if drifted {
            let chain: Vec<&str> = upstreams
                .iter()
                .map(|up| up.as_str())
                .chain(std::iter::once(name))
                .collect();
            issues.push(FreshnessIssue {
                stage,
                kind: FreshnessKind::StaleDownstream,
                message: format!(
                    "upstream docs changed but {name} was not regenerated (chain: {})",
                    chain.join(" -> ")
                ),
            });
        }
    }
    Ok((issues, changed))
}

#[cfg(test)]
#[path = "signature_tests.rs"]
mod tests;
