//! Retry/replan preparation: resolves the source task, seeds a new run from
//! its prompt/roles/mode, and records the lineage linkage for the run path.

use crate::app::{Gateway, Turn};
use crate::error::GatewayError;
use crate::resolver::{Cmd, ResolvedCommand};
use crate::store::{dedupe_roles, ManagerState, RunMode, TaskRecord};

/// Lineage state threaded into the run handler.
#[derive(Debug, Clone, Default)]
pub struct RunTransitionState {
    pub run_control_mode: String,
    pub run_source_request_id: String,
    pub run_source_task: Option<TaskRecord>,
}

/// Prepared transition from a retry/replan command to a `run`.
#[derive(Debug, Clone)]
pub struct RetryTransition {
    pub terminal: bool,
    pub orch_target: Option<String>,
    pub run_prompt: String,
    pub run_roles_override: Option<String>,
    pub run_force_mode: RunMode,
    pub control_mode: String,
    pub source_request_id: String,
    pub source_task: Option<TaskRecord>,
}

/// Rewrites the resolved command into the synthesized `run`.
pub fn apply_retry_transition(
    resolved: &mut ResolvedCommand,
    run_transition: &mut RunTransitionState,
    transition: RetryTransition,
) {
    resolved.cmd = Cmd::Run;
    resolved.rest = String::new();
    if let Some(target) = &transition.orch_target {
        if !target.trim().is_empty() {
            resolved.orch_target = Some(target.trim().to_string());
        }
    }
    resolved.run_prompt = transition.run_prompt;
    resolved.run_roles_override = transition.run_roles_override;
    resolved.run_force_mode = Some(transition.run_force_mode);
    resolved.run_no_wait_override = Some(false);
    run_transition.run_control_mode = transition.control_mode;
    run_transition.run_source_request_id = transition.source_request_id;
    run_transition.run_source_task = transition.source_task;
}

pub async fn resolve_retry_replan_transition(
    gw: &mut Gateway,
    turn: &mut Turn,
    state: &mut ManagerState,
    resolved: &ResolvedCommand,
) -> Result<Option<RetryTransition>, GatewayError> {
    let (cmd_name, explicit_ref) = match &resolved.cmd {
        Cmd::OrchRetry => ("orch-retry", resolved.orch_retry_request_id.clone()),
        Cmd::OrchReplan => ("orch-replan", resolved.orch_replan_request_id.clone()),
        _ => return Ok(None),
    };
    let slash_name = if cmd_name == "orch-retry" { "/retry" } else { "/replan" };

    let (key, paths) = gw.get_context(turn, state, resolved.orch_target.as_deref())?;
    let req_ref = {
        let explicit = explicit_ref.unwrap_or_default().trim().to_string();
        if !explicit.is_empty() {
            explicit
        } else {
            state.selected_task_ref(&turn.chat_id, &key)
        }
    };
    if req_ref.is_empty() {
        gw.send(
            turn,
            &format!("usage: {} <request_or_alias>\norch={}", slash_name, key),
            &format!("{} usage", cmd_name),
            false,
        )
        .await;
        return Ok(Some(RetryTransition::terminal()));
    }

    let req_ref = state.resolve_chat_task_ref(&turn.chat_id, &key, &req_ref);
    let req_id = state
        .project_mut(&key)
        .map(|entry| entry.resolve_task_request_id(&req_ref))
        .unwrap_or_default();
    if req_id.is_empty() {
        gw.send(
            turn,
            &format!("request not found: {} (orch={})", req_ref, key),
            &format!("{} missing", cmd_name),
            false,
        )
        .await;
        return Ok(Some(RetryTransition::terminal()));
    }

    let mut source_task = state.project(&key).and_then(|e| e.task(&req_id)).cloned();
    if source_task.is_none() {
        if let Ok(data) = gw.orch.clone().request(&paths, &req_id).await {
            if let Some(rid) = super::task::sync_snapshot(gw, state, &key, &data) {
                source_task = state.project(&key).and_then(|e| e.task(&rid)).cloned();
            }
        }
    }

    let Some(source_task) = source_task else {
        gw.send(
            turn,
            &format!("no lifecycle record for retry/replan target: {}", req_ref),
            &format!("{} missing task", cmd_name),
            false,
        )
        .await;
        return Ok(Some(RetryTransition::terminal()));
    };

    let src_prompt = source_task.prompt.trim().to_string();
    if src_prompt.is_empty() {
        gw.send(
            turn,
            &format!("cannot retry/replan: source task prompt is missing.\nrequest_id={}", req_id),
            &format!("{} missing prompt", cmd_name),
            false,
        )
        .await;
        return Ok(Some(RetryTransition::terminal()));
    }

    let source_roles = dedupe_roles(source_task.roles.iter().map(String::as_str));
    let source_mode = source_task.mode;
    state.touch_recent_task_ref(&turn.chat_id, &key, &req_id);
    state.set_selected_task_ref(&turn.chat_id, &key, &req_id);

    Ok(Some(RetryTransition {
        terminal: false,
        orch_target: Some(key),
        run_prompt: src_prompt,
        run_roles_override: if source_roles.is_empty() { None } else { Some(source_roles.join(",")) },
        run_force_mode: source_mode,
        control_mode: if cmd_name == "orch-retry" { "retry".into() } else { "replan".into() },
        source_request_id: req_id,
        source_task: Some(source_task),
    }))
}

impl RetryTransition {
    fn terminal() -> Self {
        RetryTransition {
            terminal: true,
            orch_target: None,
            run_prompt: String::new(),
            run_roles_override: None,
            run_force_mode: RunMode::Dispatch,
            control_mode: String::new(),
            source_request_id: String::new(),
            source_task: None,
        }
    }
}
