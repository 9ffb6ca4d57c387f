//! Deterministic branch names for the task → epic → PRD → main tiers.
//!
//! Names are derived from ids alone so that a branch can always be found
//! again without a side index.

use tiller_core::BranchTier;

/// Make an id safe to use as one ref path component.
///
/// Keeps ASCII alphanumerics, `-`, `_` and `.`; everything else becomes `-`.
/// Leading dots and a trailing `.lock` are neutralised because git refuses them.
pub fn sanitize_ref_component(id: &str) -> String {
    let mut out: String = id
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '-'
            }
        })
        .collect();

    while out.contains("..") {
        out = out.replace("..", ".");
    }
    if out.starts_with('.') {
        out.replace_range(0..1, "_");
    }
    if let Some(stem) = out.strip_suffix(".lock") {
        out = format!("{stem}-lock");
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Branch for a non-main tier. The main tier's branch is configuration, not
/// derived from an id, so callers pass it straight through.
pub fn tier_branch(tier: BranchTier, id: &str) -> String {
    format!("{}/{}", tier.as_str(), sanitize_ref_component(id))
}

pub fn task_branch(task_id: &str) -> String {
    tier_branch(BranchTier::Task, task_id)
}

pub fn epic_branch(epic_id: &str) -> String {
    tier_branch(BranchTier::Epic, epic_id)
}

pub fn prd_branch(prd_id: &str) -> String {
    tier_branch(BranchTier::Prd, prd_id)
}

/// Split a tier branch back into its tier and (sanitized) id.
pub fn parse_tier_branch(branch: &str) -> Option<(BranchTier, &str)> {
    let (prefix, id) = branch.split_once('/')?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    let tier = match prefix {
        "task" => BranchTier::Task,
        "epic" => BranchTier::Epic,
        "prd" => BranchTier::Prd,
        _ => return None,
    };
    Some((tier, id))
}
