//! Task-lifecycle commands: project registration, status, request snapshots,
//! progress checks, task detail, pick and cancel, plus role registration.

use serde_json::Value;

use crate::app::{EventFields, Gateway, Turn};
use crate::error::GatewayError;
use crate::lifecycle::{lifecycle_set_stage, sync_task_lifecycle, SyncInputs};
use crate::orch::ProjectPaths;
use crate::render::{
    summarize_cancel_result, summarize_request_state, summarize_task_lifecycle,
    summarize_three_stage_request, CancelOutcome,
};
use crate::resolver::{Cmd, ResolvedCommand};
use crate::roles::resolve_verifier_candidates;
use crate::store::{
    is_path_within, task_display_label, ManagerState, RunMode, Stage, StageStatus, TaskStatus,
};
use crate::util::now_iso;

/// Reconciles a raw snapshot into the project's task table with the
/// config-level verifier policy; used by every read-style command.
pub(crate) fn sync_snapshot(gw: &Gateway, state: &mut ManagerState, key: &str, data: &Value) -> Option<String> {
    let candidates = resolve_verifier_candidates(&gw.cfg.verifier_roles);
    let entry = state.project_mut(key)?;
    sync_task_lifecycle(
        entry,
        data,
        SyncInputs {
            prompt: "",
            mode: RunMode::Dispatch,
            selected_roles: None,
            verifier_roles: None,
            require_verifier: gw.cfg.require_verifier,
            verifier_candidates: &candidates,
        },
    )
}

fn remembered_request_ref(
    state: &ManagerState,
    chat_id: &str,
    key: &str,
    explicit: Option<&str>,
) -> String {
    if let Some(explicit) = explicit {
        if !explicit.trim().is_empty() {
            return explicit.trim().to_string();
        }
    }
    let selected = state.selected_task_ref(chat_id, key);
    if !selected.is_empty() {
        return selected;
    }
    state
        .project(key)
        .map(|entry| entry.last_request_id.trim().to_string())
        .unwrap_or_default()
}

fn resolve_request_id(state: &mut ManagerState, chat_id: &str, key: &str, req_ref: &str) -> String {
    let req_ref = state.resolve_chat_task_ref(chat_id, key, req_ref);
    match state.project_mut(key) {
        Some(entry) => entry.resolve_task_request_id(&req_ref),
        None => req_ref,
    }
}

fn remember_task(gw: &Gateway, state: &mut ManagerState, chat_id: &str, key: &str, req_id: &str) {
    state.touch_recent_task_ref(chat_id, key, req_id);
    state.set_selected_task_ref(chat_id, key, req_id);
    gw.persist(state);
}

pub async fn handle_orch_task_command(
    gw: &mut Gateway,
    turn: &mut Turn,
    state: &mut ManagerState,
    resolved: &ResolvedCommand,
) -> Result<bool, GatewayError> {
    match &resolved.cmd {
        Cmd::OrchAdd => handle_orch_add(gw, turn, state, resolved).await.map(|_| true),

        Cmd::Status | Cmd::OrchStatus => {
            let (key, paths) = gw.get_context(turn, state, resolved.orch_target.as_deref())?;
            let status = gw.orch.clone().status(&paths).await?;
            let entry = state.project(&key).expect("resolved project");
            let body = format!(
                "orch: {}\nroot: {}\nteam: {}\nlast_request: {}\n\n{}",
                key,
                entry.project_root,
                entry.team_dir,
                if entry.last_request_id.is_empty() { "-" } else { entry.last_request_id.as_str() },
                status
            );
            gw.send(turn, &body, "status", false).await;
            Ok(true)
        }

        Cmd::Request => {
            if resolved.rest.trim().is_empty() {
                gw.send(
                    turn,
                    "usage: /request <request_or_alias> | aoe request <request_or_alias>",
                    "request usage",
                    false,
                )
                .await;
                return Ok(true);
            }
            let (key, paths) = gw.get_context(turn, state, None)?;
            let req_id = resolve_request_id(state, &turn.chat_id, &key, &resolved.rest);
            let data = gw.orch.clone().request(&paths, &req_id).await?;
            update_last_request(state, &key, &data, &req_id);
            let rid = sync_snapshot(gw, state, &key, &data).unwrap_or_else(|| req_id.clone());
            remember_task(gw, state, &turn.chat_id, &key, &req_id);
            let task = state.project(&key).and_then(|e| e.task(&rid)).cloned();
            let body = format!("orch: {}\n{}", key, summarize_request_state(&data, task.as_ref()));
            gw.send(turn, &body, "request", false).await;
            Ok(true)
        }

        Cmd::OrchCheck => {
            let (key, paths) = gw.get_context(turn, state, resolved.orch_target.as_deref())?;
            let req_ref = remembered_request_ref(state, &turn.chat_id, &key, resolved.orch_check_request_id.as_deref());
            let req_id = resolve_request_id(state, &turn.chat_id, &key, &req_ref);
            if req_id.is_empty() {
                gw.send(
                    turn,
                    &format!(
                        "no request id. usage: aoe orch check [--orch <name>] [<request_or_alias>]\norch={}",
                        key
                    ),
                    "orch-check usage",
                    false,
                )
                .await;
                return Ok(true);
            }
            let data = gw.orch.clone().request(&paths, &req_id).await?;
            update_last_request(state, &key, &data, &req_id);
            let rid = sync_snapshot(gw, state, &key, &data).unwrap_or_else(|| req_id.clone());
            remember_task(gw, state, &turn.chat_id, &key, &req_id);
            let task = state.project(&key).and_then(|e| e.task(&rid)).cloned();
            gw.send(
                turn,
                &summarize_three_stage_request(&key, &data, task.as_ref()),
                "orch-check",
                false,
            )
            .await;
            Ok(true)
        }

        Cmd::OrchTask => {
            let (key, paths) = gw.get_context(turn, state, resolved.orch_target.as_deref())?;
            let req_ref = remembered_request_ref(state, &turn.chat_id, &key, resolved.orch_task_request_id.as_deref());
            let req_id = resolve_request_id(state, &turn.chat_id, &key, &req_ref);
            if req_id.is_empty() {
                gw.send(
                    turn,
                    &format!(
                        "no request id. usage: aoe orch task [--orch <name>] [<request_or_alias>]\norch={}",
                        key
                    ),
                    "orch-task usage",
                    false,
                )
                .await;
                return Ok(true);
            }

            let mut task = state.project(&key).and_then(|e| e.task(&req_id)).cloned();
            if task.is_none() {
                if let Ok(data) = gw.orch.clone().request(&paths, &req_id).await {
                    update_last_request(state, &key, &data, &req_id);
                    if let Some(rid) = sync_snapshot(gw, state, &key, &data) {
                        task = state.project(&key).and_then(|e| e.task(&rid)).cloned();
                    }
                }
            }

            let Some(task) = task else {
                gw.send(
                    turn,
                    &format!("no lifecycle record: request_or_alias={} (orch={})", req_ref, key),
                    "orch-task missing",
                    false,
                )
                .await;
                return Ok(true);
            };

            remember_task(gw, state, &turn.chat_id, &key, &req_id);
            gw.send(turn, &summarize_task_lifecycle(&key, &task), "orch-task", false).await;
            Ok(true)
        }

        Cmd::OrchPick => {
            let (key, _paths) = gw.get_context(turn, state, resolved.orch_target.as_deref())?;
            let req_ref = resolved
                .orch_pick_request_id
                .clone()
                .unwrap_or_default()
                .trim()
                .to_string();
            if req_ref.is_empty() {
                gw.send(
                    turn,
                    "usage: /pick <number|request_or_alias> | aoe pick <number|request_or_alias>",
                    "orch-pick usage",
                    true,
                )
                .await;
                return Ok(true);
            }
            let req_id = resolve_request_id(state, &turn.chat_id, &key, &req_ref);
            if req_id.is_empty() {
                gw.send(
                    turn,
                    &format!("task not found: {} (orch={})", req_ref, key),
                    "orch-pick missing",
                    true,
                )
                .await;
                return Ok(true);
            }

            let task = state.project(&key).and_then(|e| e.task(&req_id)).cloned();
            remember_task(gw, state, &turn.chat_id, &key, &req_id);
            let label = task_display_label(task.as_ref(), &req_id);
            gw.send(
                turn,
                &format!(
                    "selected task updated\n- orch: {}\n- task: {}\n- request_id: {}\nnext: /check, /task, /retry, /replan, /cancel",
                    key, label, req_id
                ),
                "orch-pick",
                true,
            )
            .await;
            Ok(true)
        }

        Cmd::OrchCancel => handle_orch_cancel(gw, turn, state, resolved).await.map(|_| true),

        _ => Ok(false),
    }
}

fn update_last_request(state: &mut ManagerState, key: &str, data: &Value, fallback: &str) {
    if let Some(entry) = state.project_mut(key) {
        let rid = data
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        entry.last_request_id = if rid.is_empty() { fallback.to_string() } else { rid };
        entry.touch();
    }
}

async fn handle_orch_add(
    gw: &mut Gateway,
    turn: &mut Turn,
    state: &mut ManagerState,
    resolved: &ResolvedCommand,
) -> Result<(), GatewayError> {
    let name = resolved.orch_add_name.clone().unwrap_or_default();
    let path = resolved.orch_add_path.clone().unwrap_or_default();
    if name.trim().is_empty() || path.trim().is_empty() {
        gw.send(
            turn,
            "usage: aoe orch add <name> --path <project_root> [--overview <text>] [--init|--no-init] [--spawn|--no-spawn]",
            "orch-add usage",
            false,
        )
        .await;
        return Ok(());
    }

    let project_root = match std::fs::canonicalize(&path) {
        Ok(p) => p,
        Err(_) => std::path::PathBuf::from(&path),
    };
    if let Some(workspace_root) = &gw.cfg.workspace_root {
        if !is_path_within(&project_root, Some(workspace_root)) {
            gw.send(
                turn,
                &format!(
                    "error: path must be under workspace root ({})\npath={}",
                    workspace_root.display(),
                    project_root.display()
                ),
                "orch-add path",
                false,
            )
            .await;
            return Ok(());
        }
    }

    let team_dir = project_root.join(".aoe-team");
    let overview = {
        let o = resolved.orch_add_overview.clone().unwrap_or_default().trim().to_string();
        if o.is_empty() {
            format!("{} project orchestration", name)
        } else {
            o
        }
    };

    if gw.cfg.dry_run {
        gw.send(
            turn,
            &format!(
                "[DRY-RUN] orch add\n- name: {}\n- path: {}\n- team: {}\n- init: {}\n- spawn: {}\n- set_active: {}",
                name,
                project_root.display(),
                team_dir.display(),
                if resolved.orch_add_init { "yes" } else { "no" },
                if resolved.orch_add_spawn { "yes" } else { "no" },
                if resolved.orch_add_set_active { "yes" } else { "no" },
            ),
            "orch-add dry-run",
            false,
        )
        .await;
        return Ok(());
    }

    std::fs::create_dir_all(&project_root)?;
    let key = state.register_project(&name, &project_root, &team_dir, &overview, resolved.orch_add_set_active);
    turn.log_team_dir = team_dir.clone();
    let paths = ProjectPaths {
        project_root: project_root.clone(),
        team_dir: team_dir.clone(),
    };

    let mut init_logs: Vec<String> = Vec::new();
    let cfg_exists = team_dir.join("orchestrator.json").exists();
    if resolved.orch_add_init || !cfg_exists {
        init_logs.push(gw.orch.clone().init(&paths, &overview).await?);
    }
    if resolved.orch_add_spawn {
        init_logs.push(gw.orch.clone().spawn(&paths).await?);
    }

    if let Some(entry) = state.project_mut(&key) {
        entry.touch();
    }
    gw.persist(state);

    let entry = state.project(&key).expect("registered project");
    let mut lines = vec![
        format!("orch ready: {}", key),
        format!("root: {}", entry.project_root),
        format!("team: {}", entry.team_dir),
        format!("active: {}", if state.active == key { "yes" } else { "no" }),
    ];
    if !init_logs.is_empty() {
        lines.push("logs:".to_string());
        for row in &init_logs {
            let last = row.trim().lines().last().unwrap_or("(empty)");
            lines.push(last.to_string());
        }
    }
    gw.send(turn, &lines.join("\n"), "orch-add", false).await;
    Ok(())
}

async fn handle_orch_cancel(
    gw: &mut Gateway,
    turn: &mut Turn,
    state: &mut ManagerState,
    resolved: &ResolvedCommand,
) -> Result<(), GatewayError> {
    let (key, paths) = gw.get_context(turn, state, resolved.orch_target.as_deref())?;
    let req_ref = remembered_request_ref(state, &turn.chat_id, &key, resolved.orch_cancel_request_id.as_deref());
    let req_id = resolve_request_id(state, &turn.chat_id, &key, &req_ref);
    if req_id.is_empty() {
        gw.send(
            turn,
            &format!(
                "no request id. usage: /cancel <request_or_alias> | aoe orch cancel [--orch <name>] [<request_or_alias>]\norch={}",
                key
            ),
            "orch-cancel usage",
            false,
        )
        .await;
        return Ok(());
    }

    let orch = gw.orch.clone();
    let state_before = orch.request(&paths, &req_id).await?;
    let note = format!("canceled by telegram:{}", turn.chat_id);
    let cancel_result = cancel_request_assignments(gw, &paths, &state_before, &note).await;
    let state_after = match orch.request(&paths, &req_id).await {
        Ok(data) => data,
        Err(_) => state_before,
    };

    update_last_request(state, &key, &state_after, &req_id);
    let rid = sync_snapshot(gw, state, &key, &state_after);

    if let Some(rid) = &rid {
        if let Some(task) = state.project_mut(&key).and_then(|e| e.tasks.get_mut(rid)) {
            lifecycle_set_stage(task, Stage::Execution, StageStatus::Failed, &note);
            lifecycle_set_stage(task, Stage::Verification, StageStatus::Failed, &note);
            lifecycle_set_stage(task, Stage::Integration, StageStatus::Failed, &note);
            lifecycle_set_stage(task, Stage::Close, StageStatus::Failed, &note);
            task.status = TaskStatus::Failed;
            task.canceled = true;
            task.canceled_at = Some(now_iso());
            task.canceled_by = Some(format!("telegram:{}", turn.chat_id));
            task.updated_at = now_iso();
        }
    }

    remember_task(gw, state, &turn.chat_id, &key, &req_id);
    let task = rid.as_deref().and_then(|r| state.project(&key).and_then(|e| e.task(r))).cloned();
    gw.send(
        turn,
        &summarize_cancel_result(&key, &req_id, task.as_ref(), &cancel_result),
        "orch-cancel",
        true,
    )
    .await;
    gw.log_event(
        turn,
        "dispatch_canceled",
        EventFields {
            project: &key,
            request_id: &req_id,
            task: task.as_ref(),
            stage: "close",
            status: "failed",
            ..EventFields::default()
        },
    );
    Ok(())
}

/// Fails every non-terminal assignment that has a message id; terminal or
/// id-less roles are reported as skipped.
async fn cancel_request_assignments(
    gw: &Gateway,
    paths: &ProjectPaths,
    request_data: &Value,
    note: &str,
) -> CancelOutcome {
    let mut targets: Vec<(String, String, String)> = Vec::new();
    let mut skipped: Vec<String> = Vec::new();

    if let Some(roles) = request_data.get("roles").and_then(Value::as_array) {
        for row in roles {
            if !row.is_object() {
                continue;
            }
            let role = row.get("role").and_then(Value::as_str).unwrap_or_default().trim().to_string();
            let status = row
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_lowercase();
            let message_id = row
                .get("message_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            let label_role = if role.is_empty() { "?".to_string() } else { role.clone() };
            if message_id.is_empty() {
                skipped.push(format!("{}(no_message_id)", label_role));
                continue;
            }
            if matches!(status.as_str(), "done" | "failed" | "error" | "fail") {
                let status_label = if status.is_empty() { "terminal".to_string() } else { status };
                skipped.push(format!("{}({})", label_role, status_label));
                continue;
            }
            targets.push((role, status, message_id));
        }
    }

    let mut canceled: Vec<String> = Vec::new();
    let mut failed: Vec<String> = Vec::new();
    for (role, status, message_id) in &targets {
        let (ok, detail) = gw.orch.clone().fail_message(paths, message_id, role, note).await;
        let label = format!(
            "{}:{}:{}",
            if role.is_empty() { "?" } else { role },
            message_id,
            if status.is_empty() { "pending" } else { status }
        );
        if ok {
            canceled.push(label);
        } else {
            failed.push(format!("{}:{}", label, detail.chars().take(120).collect::<String>()));
        }
    }

    CancelOutcome {
        request_id: request_data
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
        targets: targets.len(),
        canceled,
        failed,
        skipped,
    }
}

/// `add-role` passthrough with a dry-run preview.
pub async fn handle_add_role_command(
    gw: &mut Gateway,
    turn: &mut Turn,
    state: &mut ManagerState,
    resolved: &ResolvedCommand,
) -> Result<bool, GatewayError> {
    if resolved.cmd != Cmd::AddRole {
        return Ok(false);
    }

    let Some(role) = resolved.add_role_name.as_deref().filter(|r| !r.trim().is_empty()) else {
        gw.send(
            turn,
            "usage: aoe add-role <Role> [--provider <name>] [--launch <cmd>] [--spawn|--no-spawn]",
            "add-role usage",
            false,
        )
        .await;
        return Ok(true);
    };

    let (key, paths) = gw.get_context(turn, state, None)?;
    if gw.cfg.dry_run {
        gw.send(
            turn,
            &format!(
                "[DRY-RUN] add-role\n- orch: {}\n- role: {}\n- provider: {}\n- launch: {}\n- spawn: {}",
                key,
                role,
                resolved.add_role_provider.as_deref().unwrap_or("codex"),
                resolved.add_role_launch.as_deref().unwrap_or("(default)"),
                if resolved.add_role_spawn { "yes" } else { "no" },
            ),
            "add-role dry-run",
            false,
        )
        .await;
        return Ok(true);
    }

    let result = gw
        .orch
        .clone()
        .add_role(
            &paths,
            role,
            resolved.add_role_provider.as_deref(),
            resolved.add_role_launch.as_deref(),
            resolved.add_role_spawn,
        )
        .await?;
    gw.send(turn, &format!("orch: {}\n{}", key, result), "add-role", false).await;
    Ok(true)
}
