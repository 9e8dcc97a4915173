//! Role selection helpers: CSV parsing, verifier candidates, the verifier
//! auto-add rule, and the keyword-based auto-dispatch classifier.

use crate::store::dedupe_roles;

pub const DEFAULT_VERIFIER_ROLES: &str = "Reviewer,QA,Verifier";

/// Splits a role CSV, trimming and deduplicating case-insensitively while
/// keeping the first spelling seen.
pub fn parse_roles_csv(raw: &str) -> Vec<String> {
    dedupe_roles(raw.split(','))
}

/// Verifier candidate list from config, falling back to the default set.
pub fn resolve_verifier_candidates(raw: &str) -> Vec<String> {
    let parsed = parse_roles_csv(if raw.trim().is_empty() { DEFAULT_VERIFIER_ROLES } else { raw });
    if parsed.is_empty() {
        parse_roles_csv(DEFAULT_VERIFIER_ROLES)
    } else {
        parsed
    }
}

/// Worker roles a planner may target: everything but the orchestrator role,
/// with `Reviewer` as the last-resort fallback.
pub fn available_worker_roles(available_roles: &[String]) -> Vec<String> {
    let workers: Vec<String> = dedupe_roles(available_roles.iter().map(String::as_str))
        .into_iter()
        .filter(|r| r.to_lowercase() != "orchestrator")
        .collect();
    if workers.is_empty() {
        vec!["Reviewer".to_string()]
    } else {
        workers
    }
}

/// Ensures the selection contains a verifier when one is available. Returns
/// `(selected, selected_verifiers, auto_added, available_verifiers)`.
pub fn ensure_verifier_roles(
    selected_roles: &[String],
    available_roles: &[String],
    verifier_candidates: &[String],
) -> (Vec<String>, Vec<String>, bool, Vec<String>) {
    let mut selected = dedupe_roles(selected_roles.iter().map(String::as_str));
    let available = dedupe_roles(available_roles.iter().map(String::as_str));

    let candidate_keys: Vec<String> = verifier_candidates
        .iter()
        .filter(|c| !c.trim().is_empty())
        .map(|c| c.to_lowercase())
        .collect();
    let mut selected_verifiers: Vec<String> = selected
        .iter()
        .filter(|r| candidate_keys.contains(&r.to_lowercase()))
        .cloned()
        .collect();

    let mut available_verifiers: Vec<String> = Vec::new();
    for cand in verifier_candidates {
        let ckey = cand.to_lowercase();
        for role in &available {
            if role.to_lowercase() == ckey && !available_verifiers.contains(role) {
                available_verifiers.push(role.clone());
            }
        }
    }

    let mut added = false;
    if selected_verifiers.is_empty() {
        if let Some(first) = available_verifiers.first() {
            selected.push(first.clone());
            selected_verifiers = vec![first.clone()];
            added = true;
        }
    }

    (
        dedupe_roles(selected.iter().map(String::as_str)),
        dedupe_roles(selected_verifiers.iter().map(String::as_str)),
        added,
        available_verifiers,
    )
}

/// Keyword classifier for `--auto-dispatch`: data-ish prompts get a
/// DataEngineer, review-ish prompts a Reviewer, "both"-ish prompts both.
pub fn choose_auto_dispatch_roles(prompt: &str) -> Vec<String> {
    let lower = prompt.to_lowercase();
    let mut roles: Vec<String> = Vec::new();

    const DATA_KEYS: &[&str] = &[
        "data", "dataset", "etl", "schema", "sql", "pipeline",
        "품질", "데이터", "스키마", "적재", "정합성", "검증",
    ];
    const REVIEW_KEYS: &[&str] = &[
        "review", "risk", "regression", "test", "qa", "bug",
        "리뷰", "리스크", "회귀", "테스트", "버그", "검토",
    ];
    const BOTH_KEYS: &[&str] = &["both", "둘 다", "둘다", "각각", "cross-check", "교차"];

    if DATA_KEYS.iter().any(|k| lower.contains(k)) {
        roles.push("DataEngineer".to_string());
    }
    if REVIEW_KEYS.iter().any(|k| lower.contains(k)) && !roles.contains(&"Reviewer".to_string()) {
        roles.push("Reviewer".to_string());
    }
    if roles.is_empty() && BOTH_KEYS.iter().any(|k| lower.contains(k)) {
        roles = vec!["DataEngineer".to_string(), "Reviewer".to_string()];
    }

    roles
}
