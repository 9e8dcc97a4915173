//! Lifecycle reconciliation: folds an orchestrator status snapshot into the
//! seven-stage task state machine.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::store::{
    dedupe_roles, ProjectEntry, RunMode, Stage, StageStatus, TaskRecord, TaskStatus,
    TASK_HISTORY_LIMIT,
};
use crate::util::now_iso;

/// One role line from a snapshot.
#[derive(Debug, Clone)]
pub struct RoleRow {
    pub role: String,
    pub status: String,
    pub message_id: String,
}

/// Normalized view over the orchestrator/worker snapshot payload.
#[derive(Debug, Clone, Default)]
pub struct RequestSnapshot {
    pub request_id: String,
    pub rows: Vec<RoleRow>,
    pub assignments: i64,
    pub replies: i64,
    pub complete: bool,
    pub done_roles: Vec<String>,
    pub failed_roles: Vec<String>,
    pub pending_roles: Vec<String>,
}

fn str_items(data: &Value, key: &str) -> Vec<String> {
    data.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Role rows in order of preference: `role_states`, object-form `roles`,
/// string-form `roles` against the done/failed/pending sets, then the union
/// of those sets alone.
pub fn normalize_role_rows(data: &Value) -> Vec<RoleRow> {
    let mut rows: Vec<RoleRow> = Vec::new();

    let push_object_rows = |items: &[Value], rows: &mut Vec<RoleRow>| {
        for item in items {
            if !item.is_object() {
                continue;
            }
            let role = item.get("role").and_then(Value::as_str).unwrap_or_default().trim().to_string();
            if role.is_empty() {
                continue;
            }
            let status = {
                let s = item
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_lowercase();
                if s.is_empty() { "pending".to_string() } else { s }
            };
            let message_id = item
                .get("message_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            rows.push(RoleRow { role, status, message_id });
        }
    };

    if let Some(items) = data.get("role_states").and_then(Value::as_array) {
        push_object_rows(items, &mut rows);
    }
    if !rows.is_empty() {
        return rows;
    }

    let roles_obj = data.get("roles").and_then(Value::as_array);
    if let Some(items) = roles_obj {
        if items.first().map(Value::is_object).unwrap_or(false) {
            push_object_rows(items, &mut rows);
            if !rows.is_empty() {
                return rows;
            }
        }
    }

    let done_set: BTreeSet<String> = str_items(data, "done_roles").into_iter().collect();
    let failed_set: BTreeSet<String> = str_items(data, "failed_roles").into_iter().collect();
    let pending_list = {
        let p = str_items(data, "pending_roles");
        if p.is_empty() { str_items(data, "unresolved_roles") } else { p }
    };
    let pending_set: BTreeSet<String> = pending_list.into_iter().collect();

    if let Some(items) = roles_obj {
        for item in items {
            let role = item.as_str().unwrap_or_default().trim().to_string();
            if role.is_empty() {
                continue;
            }
            let status = if failed_set.contains(&role) {
                "failed"
            } else if done_set.contains(&role) {
                "done"
            } else {
                "pending"
            };
            rows.push(RoleRow {
                role,
                status: status.to_string(),
                message_id: String::new(),
            });
        }
        if !rows.is_empty() {
            return rows;
        }
    }

    let mut all: Vec<String> = Vec::new();
    all.extend(done_set.iter().cloned());
    all.extend(failed_set.iter().cloned());
    all.extend(pending_set.iter().cloned());
    for role in dedupe_roles(all) {
        let status = if failed_set.contains(&role) {
            "failed"
        } else if done_set.contains(&role) {
            "done"
        } else {
            "pending"
        };
        rows.push(RoleRow {
            role,
            status: status.to_string(),
            message_id: String::new(),
        });
    }
    rows
}

/// Normalizes a raw snapshot: role sets reconciled (failed > done > pending),
/// counts falling back to row/reply lengths.
pub fn extract_request_snapshot(data: &Value) -> RequestSnapshot {
    let rows = normalize_role_rows(data);
    let counts = data.get("counts").cloned().unwrap_or(Value::Null);

    let mut assignments = counts.get("assignments").and_then(Value::as_i64).unwrap_or(0);
    let mut replies = counts.get("replies").and_then(Value::as_i64).unwrap_or(0);
    if assignments <= 0 {
        assignments = rows.len() as i64;
    }
    if replies <= 0 {
        replies = data.get("replies").and_then(Value::as_array).map(|r| r.len() as i64).unwrap_or(0);
    }

    let mut done_roles: BTreeSet<String> = BTreeSet::new();
    let mut failed_roles: BTreeSet<String> = BTreeSet::new();
    let mut pending_roles: BTreeSet<String> = BTreeSet::new();

    for row in &rows {
        if row.role.is_empty() {
            continue;
        }
        match row.status.as_str() {
            "failed" | "error" | "fail" => {
                failed_roles.insert(row.role.clone());
            }
            "done" => {
                done_roles.insert(row.role.clone());
            }
            _ => {
                pending_roles.insert(row.role.clone());
            }
        }
    }

    for role in str_items(data, "done_roles") {
        done_roles.insert(role.clone());
        pending_roles.remove(&role);
        failed_roles.remove(&role);
    }
    for role in str_items(data, "failed_roles") {
        failed_roles.insert(role.clone());
        done_roles.remove(&role);
        pending_roles.remove(&role);
    }
    let pending_list = {
        let p = str_items(data, "pending_roles");
        if p.is_empty() { str_items(data, "unresolved_roles") } else { p }
    };
    for role in pending_list {
        if !done_roles.contains(&role) && !failed_roles.contains(&role) {
            pending_roles.insert(role);
        }
    }

    RequestSnapshot {
        request_id: data
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
        rows,
        assignments,
        replies,
        complete: data.get("complete").and_then(Value::as_bool).unwrap_or(false),
        done_roles: done_roles.into_iter().collect(),
        failed_roles: failed_roles.into_iter().collect(),
        pending_roles: pending_roles.into_iter().collect(),
    }
}

/// Writes one stage status through the task, appending a history event only
/// on a status change or when a note is supplied.
pub fn lifecycle_set_stage(task: &mut TaskRecord, stage: Stage, status: StageStatus, note: &str) {
    let prev = task.stages.get(stage);
    if prev == status && note.is_empty() {
        return;
    }

    task.stages.set(stage, status);
    task.stage = stage;

    let at = now_iso();
    task.history.push(crate::store::HistoryEvent {
        at: at.clone(),
        stage,
        status,
        note: if note.is_empty() { None } else { Some(note.to_string()) },
    });
    if task.history.len() > TASK_HISTORY_LIMIT {
        let excess = task.history.len() - TASK_HISTORY_LIMIT;
        task.history.drain(..excess);
    }
    task.updated_at = at;
}

/// Inputs the caller threads through reconciliation.
#[derive(Debug, Clone)]
pub struct SyncInputs<'a> {
    pub prompt: &'a str,
    pub mode: RunMode,
    pub selected_roles: Option<&'a [String]>,
    pub verifier_roles: Option<&'a [String]>,
    pub require_verifier: bool,
    pub verifier_candidates: &'a [String],
}

/// Reconciles a snapshot into the project's task record, deriving all seven
/// stage statuses and the overall status. Returns the request id of the
/// touched task, or `None` when the snapshot has no request id.
pub fn sync_task_lifecycle(entry: &mut ProjectEntry, request_data: &Value, inputs: SyncInputs<'_>) -> Option<String> {
    let snap = extract_request_snapshot(request_data);
    if snap.request_id.is_empty() {
        return None;
    }

    let inferred_roles: Vec<String> = snap
        .rows
        .iter()
        .map(|r| r.role.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    let roles = dedupe_roles(match inputs.selected_roles {
        Some(selected) if !selected.is_empty() => selected.to_vec(),
        _ => inferred_roles,
    });

    let candidate_keys: BTreeSet<String> = inputs.verifier_candidates.iter().map(|c| c.to_lowercase()).collect();
    let inferred_verifiers: Vec<String> = roles
        .iter()
        .filter(|r| candidate_keys.contains(&r.to_lowercase()))
        .cloned()
        .collect();
    let verifiers = dedupe_roles(match inputs.verifier_roles {
        Some(v) if !v.is_empty() => v.to_vec(),
        _ => inferred_verifiers,
    });

    let request_id = entry.ensure_task_record(
        &snap.request_id,
        inputs.prompt,
        inputs.mode,
        &roles,
        &verifiers,
        inputs.require_verifier,
    );

    let done_roles: BTreeSet<&String> = snap.done_roles.iter().collect();
    let failed_roles: BTreeSet<&String> = snap.failed_roles.iter().collect();

    let task = entry.tasks.get_mut(&request_id)?;

    lifecycle_set_stage(task, Stage::Intake, StageStatus::Done, "");
    lifecycle_set_stage(task, Stage::Planning, StageStatus::Done, "");

    let staffing_status = if snap.assignments > 0 {
        StageStatus::Done
    } else if !roles.is_empty() {
        StageStatus::Running
    } else {
        StageStatus::Pending
    };
    lifecycle_set_stage(task, Stage::Staffing, staffing_status, "");

    let execution_status = if !snap.failed_roles.is_empty() {
        StageStatus::Failed
    } else if snap.complete && snap.assignments > 0 && snap.pending_roles.is_empty() {
        StageStatus::Done
    } else if snap.assignments > 0 {
        StageStatus::Running
    } else {
        StageStatus::Pending
    };
    lifecycle_set_stage(task, Stage::Execution, execution_status, "");

    let mut ver_note = "";
    let verification_status = if inputs.require_verifier {
        if verifiers.is_empty() {
            ver_note = "no verifier role assigned";
            StageStatus::Failed
        } else if verifiers.iter().any(|v| failed_roles.contains(v)) {
            ver_note = "verifier role failed";
            StageStatus::Failed
        } else if verifiers.iter().all(|v| done_roles.contains(v)) {
            StageStatus::Done
        } else if snap.complete && execution_status == StageStatus::Done {
            ver_note = "verifier gate not satisfied";
            StageStatus::Failed
        } else if matches!(execution_status, StageStatus::Running | StageStatus::Done) {
            StageStatus::Running
        } else if execution_status == StageStatus::Failed {
            StageStatus::Failed
        } else {
            StageStatus::Pending
        }
    } else {
        match execution_status {
            StageStatus::Done => StageStatus::Done,
            StageStatus::Failed => StageStatus::Failed,
            StageStatus::Running => StageStatus::Running,
            StageStatus::Pending => StageStatus::Pending,
        }
    };
    lifecycle_set_stage(task, Stage::Verification, verification_status, ver_note);

    let integration_status = if execution_status == StageStatus::Failed || verification_status == StageStatus::Failed {
        StageStatus::Failed
    } else if verification_status == StageStatus::Done && (snap.replies > 0 || snap.complete) {
        StageStatus::Done
    } else if execution_status == StageStatus::Running || verification_status == StageStatus::Running {
        StageStatus::Running
    } else {
        StageStatus::Pending
    };
    lifecycle_set_stage(task, Stage::Integration, integration_status, "");

    let close_status = if integration_status == StageStatus::Failed {
        StageStatus::Failed
    } else if integration_status == StageStatus::Done && snap.complete {
        StageStatus::Done
    } else if execution_status == StageStatus::Running || verification_status == StageStatus::Running {
        StageStatus::Running
    } else {
        StageStatus::Pending
    };
    lifecycle_set_stage(task, Stage::Close, close_status, "");

    let overall = if close_status == StageStatus::Failed
        || verification_status == StageStatus::Failed
        || execution_status == StageStatus::Failed
    {
        TaskStatus::Failed
    } else if close_status == StageStatus::Done {
        TaskStatus::Completed
    } else if close_status == StageStatus::Running
        || execution_status == StageStatus::Running
        || verification_status == StageStatus::Running
    {
        TaskStatus::Running
    } else {
        TaskStatus::Pending
    };

    task.status = overall;
    task.roles = roles;
    task.verifier_roles = verifiers;
    task.require_verifier = inputs.require_verifier;
    task.updated_at = now_iso();
    task.result = crate::store::TaskResult {
        assignments: snap.assignments,
        replies: snap.replies,
        complete: snap.complete,
        done_roles: snap.done_roles.clone(),
        failed_roles: snap.failed_roles.clone(),
        pending_roles: snap.pending_roles.clone(),
    };

    entry.trim_tasks();
    Some(request_id)
}
