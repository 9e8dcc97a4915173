//! The run path: guards, planning, dispatch/direct execution, lifecycle
//! sync, lineage, and the reply ladder. Also redeems `/ok` confirmations.

use serde_json::Value;

use super::retry::RunTransitionState;
use crate::app::{EventFields, Gateway, Turn};
use crate::error::{GatewayError, ERROR_GATE};
use crate::guards::{confirm_expired, summarize_chat_usage};
use crate::lifecycle::{lifecycle_set_stage, sync_task_lifecycle, SyncInputs};
use crate::llm::LlmClient;
use crate::orch::{load_orchestrator_roles, OrchRunOptions, ProjectPaths};
use crate::parse::detect_high_risk_prompt;
use crate::plan::{
    build_planned_dispatch_prompt, build_task_execution_plan, critic_has_blockers,
    critique_task_execution_plan, normalize_task_plan_payload, plan_roles_from_subtasks,
    repair_task_execution_plan, PlanCritic, ReplanAttempt, TaskPlan,
};
use crate::render::{help_text, render_run_response, summarize_task_lifecycle};
use crate::resolver::{Cmd, ResolvedCommand};
use crate::roles::{
    available_worker_roles, choose_auto_dispatch_roles, ensure_verifier_roles, parse_roles_csv,
    resolve_verifier_candidates,
};
use crate::store::{ManagerState, RunMode, Stage, StageStatus, TaskRecord};
use crate::util::now_iso;

/// Redeems a pending high-risk confirmation on `/ok`. Returns true when the
/// turn is finished (no token, or expired); on success the resolved command
/// mutates into the stored run and the pipeline continues.
pub async fn apply_confirm_run_transition(
    gw: &mut Gateway,
    turn: &mut Turn,
    state: &mut ManagerState,
    resolved: &mut ResolvedCommand,
) -> Result<bool, GatewayError> {
    if resolved.cmd != Cmd::ConfirmRun {
        return Ok(false);
    }

    let Some(confirm) = state.confirm_action(&turn.chat_id).cloned() else {
        gw.send(
            turn,
            "확인 대기 중인 실행이 없습니다.\n고위험 평문 자동실행이 감지되면 /ok 로 승인할 수 있습니다.",
            "confirm-empty",
            true,
        )
        .await;
        return Ok(true);
    };

    if confirm_expired(&confirm, gw.cfg.confirm_ttl_sec) {
        state.clear_confirm_action(&turn.chat_id);
        gw.persist(state);
        gw.send(
            turn,
            "확인 요청이 만료되었습니다.\n다시 평문으로 요청하거나 /dispatch 로 재실행하세요.",
            "confirm-expired",
            true,
        )
        .await;
        return Ok(true);
    }

    state.clear_confirm_action(&turn.chat_id);
    gw.persist(state);

    resolved.cmd = Cmd::Run;
    resolved.run_prompt = confirm.prompt.trim().to_string();
    resolved.run_force_mode = Some(confirm.mode);
    if let Some(orch) = confirm.orch.as_deref().filter(|o| !o.trim().is_empty()) {
        resolved.orch_target = Some(orch.trim().to_string());
    }
    resolved.run_auto_source = "confirmed".to_string();
    Ok(false)
}

fn resolve_dispatch_mode_and_roles(
    run_force_mode: Option<RunMode>,
    run_roles_override: Option<&str>,
    project_roles_csv: &str,
    auto_dispatch_enabled: bool,
    prompt: &str,
) -> (bool, String) {
    let explicit_roles = run_roles_override.unwrap_or(project_roles_csv).trim().to_string();
    let auto_roles = if auto_dispatch_enabled {
        choose_auto_dispatch_roles(prompt)
    } else {
        Vec::new()
    };

    match run_force_mode {
        Some(RunMode::Direct) => (false, String::new()),
        Some(RunMode::Dispatch) => {
            let roles = if !explicit_roles.is_empty() {
                explicit_roles
            } else if !auto_roles.is_empty() {
                auto_roles.join(",")
            } else {
                "Reviewer".to_string()
            };
            (true, roles)
        }
        None => {
            if !explicit_roles.is_empty() {
                (true, explicit_roles)
            } else if auto_dispatch_enabled && !auto_roles.is_empty() {
                (true, auto_roles.join(","))
            } else {
                (false, String::new())
            }
        }
    }
}

#[derive(Debug, Default)]
struct PlanOutcome {
    selected_roles: Vec<String>,
    plan_data: Option<TaskPlan>,
    plan_critic: PlanCritic,
    plan_roles: Vec<String>,
    plan_replans: Vec<ReplanAttempt>,
    plan_error: String,
    plan_gate_blocked: bool,
    plan_gate_reason: String,
    planning_enabled: bool,
    reuse_source_plan: bool,
}

#[allow(clippy::too_many_arguments)]
async fn compute_dispatch_plan(
    gw: &Gateway,
    paths: &ProjectPaths,
    prompt: &str,
    dispatch_mode: bool,
    run_control_mode: &str,
    run_source_task: Option<&TaskRecord>,
    selected_roles: Vec<String>,
    available_roles: &[String],
) -> PlanOutcome {
    let planning_enabled = gw.cfg.task_planning || run_control_mode == "replan";
    let reuse_source_plan =
        run_control_mode == "retry" && run_source_task.map(|t| t.plan.is_some()).unwrap_or(false);

    let mut out = PlanOutcome {
        selected_roles,
        planning_enabled,
        reuse_source_plan,
        ..PlanOutcome::default()
    };

    if !(dispatch_mode && (planning_enabled || reuse_source_plan) && !gw.cfg.dry_run) {
        return out;
    }

    let llm: &dyn LlmClient = gw.llm.as_ref();
    let max_subtasks = gw.cfg.plan_max_subtasks.max(1);
    let timeout = gw.cfg.orch_command_timeout_sec;

    let planned: Result<(), GatewayError> = async {
        if reuse_source_plan {
            let source = run_source_task.expect("reuse implies source");
            let source_value = source.plan.as_ref().and_then(|p| serde_json::to_value(p).ok());
            out.plan_data = Some(normalize_task_plan_payload(
                source_value.as_ref(),
                prompt,
                &available_worker_roles(available_roles),
                max_subtasks,
            ));
            out.plan_critic = match &source.plan_critic {
                Some(critic) => PlanCritic {
                    approved: critic.approved,
                    issues: critic
                        .issues
                        .iter()
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .take(8)
                        .collect(),
                    recommendations: critic
                        .recommendations
                        .iter()
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .take(8)
                        .collect(),
                },
                None => PlanCritic::default(),
            };
        }

        if out.plan_data.is_none() && planning_enabled {
            let plan =
                build_task_execution_plan(llm, &paths.project_root, prompt, available_roles, max_subtasks, timeout)
                    .await?;
            let mut critic = critique_task_execution_plan(llm, &paths.project_root, prompt, &plan, timeout).await;
            let mut plan = plan;

            if gw.cfg.plan_auto_replan {
                for attempt in 1..=gw.cfg.plan_replan_attempts {
                    if !critic_has_blockers(&critic) {
                        break;
                    }
                    plan = repair_task_execution_plan(
                        llm,
                        &paths.project_root,
                        prompt,
                        &plan,
                        &critic,
                        available_roles,
                        max_subtasks,
                        attempt,
                        timeout,
                    )
                    .await?;
                    critic = critique_task_execution_plan(llm, &paths.project_root, prompt, &plan, timeout).await;
                    out.plan_replans.push(ReplanAttempt {
                        attempt,
                        critic: if critic_has_blockers(&critic) {
                            "needs_fix".to_string()
                        } else {
                            "approved".to_string()
                        },
                        subtasks: plan.subtasks.len(),
                    });
                }
            }
            out.plan_data = Some(plan);
            out.plan_critic = critic;
        }
        Ok(())
    }
    .await;

    if let Err(e) = planned {
        out.plan_data = None;
        out.plan_critic = PlanCritic::default();
        out.plan_roles = Vec::new();
        out.plan_replans = Vec::new();
        out.plan_error = e.to_string().chars().take(260).collect();
        return out;
    }

    if let Some(plan) = &out.plan_data {
        out.plan_roles = plan_roles_from_subtasks(plan);
        if out.selected_roles.is_empty() && !out.plan_roles.is_empty() {
            out.selected_roles = out.plan_roles.clone();
        }
        if gw.cfg.plan_block_on_critic && critic_has_blockers(&out.plan_critic) {
            let lead = out
                .plan_critic
                .issues
                .first()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "critic unresolved after auto-replan".to_string());
            out.plan_gate_blocked = true;
            out.plan_gate_reason = lead.chars().take(240).collect();
        }
    }
    out
}

async fn run_orchestrator_direct(gw: &Gateway, paths: &ProjectPaths, user_prompt: &str) -> Result<String, GatewayError> {
    let prompt = format!(
        "너는 프로젝트 오케스트레이터다. 텔레그램 사용자와 자연스럽게 대화하듯 답해라.\n\
         원칙:\n\
         - 한국어\n\
         - 사용자가 묻지 않으면 내부 역할/프로토콜/요청ID를 노출하지 않는다\n\
         - 과장하거나 근거 없는 수치를 단정하지 않는다\n\
         - 실무적으로 간결하게 답하고, 필요할 때만 다음 행동을 제안한다\n\n\
         사용자 요청:\n{}\n",
        user_prompt.trim()
    );
    gw.llm
        .clone()
        .exec(&paths.project_root, &prompt, gw.cfg.orch_command_timeout_sec.clamp(90, 900))
        .await
}

async fn synthesize_orchestrator_response(
    gw: &Gateway,
    paths: &ProjectPaths,
    user_prompt: &str,
    request_data: &Value,
) -> Result<String, GatewayError> {
    let mut chunks: Vec<String> = Vec::new();
    if let Some(replies) = request_data.get("replies").and_then(Value::as_array) {
        for r in replies.iter().take(8) {
            let role = r
                .get("role")
                .or_else(|| r.get("from"))
                .and_then(Value::as_str)
                .unwrap_or("agent")
                .trim()
                .to_string();
            let role = if role.is_empty() { "agent".to_string() } else { role };
            let body = r.get("body").and_then(Value::as_str).unwrap_or_default().trim().to_string();
            if !body.is_empty() {
                chunks.push(format!("[{}]\n{}", role, body));
            }
        }
    }
    let joined = {
        let j = chunks.join("\n\n").trim().to_string();
        if j.is_empty() { "(no replies)".to_string() } else { j }
    };

    let prompt = format!(
        "너는 팀 오케스트레이터다. 아래 서브에이전트 답변을 사용자용 단일 답변으로 통합해라.\n\
         규칙:\n\
         - 한국어\n\
         - 내부 역할명/프로토콜/요청ID 같은 운영 디테일은 숨긴다\n\
         - 서로 모순되는 내용은 보수적으로 정리하고, 불확실하면 불확실하다고 명시한다\n\
         - 실행 근거 없는 수치/사실은 단정하지 않는다\n\
         - 사용자에게는 자연스러운 한 목소리로 답한다\n\n\
         사용자 요청:\n{}\n\n\
         서브에이전트 답변:\n{}\n",
        user_prompt.trim(),
        joined
    );
    gw.llm
        .clone()
        .exec(&paths.project_root, &prompt, gw.cfg.orch_command_timeout_sec.clamp(90, 900))
        .await
}

/// The terminal stretch of the pipeline: run commands, default-mode plain
/// text, and unknown-command replies.
pub async fn handle_run_or_unknown_command(
    gw: &mut Gateway,
    turn: &mut Turn,
    state: &mut ManagerState,
    resolved: &ResolvedCommand,
    run_transition: &RunTransitionState,
    text: &str,
) -> Result<(), GatewayError> {
    let is_run = matches!(resolved.cmd, Cmd::Run | Cmd::OrchRun);

    // Prompt resolution, or the unknown-command reply.
    let prompt = if is_run {
        let p = if !resolved.run_prompt.trim().is_empty() {
            resolved.run_prompt.trim().to_string()
        } else {
            resolved.rest.trim().to_string()
        };
        if p.is_empty() {
            gw.send(
                turn,
                "usage: /run <prompt> | /dispatch <prompt> | /direct <prompt> | aoe run [--direct|--dispatch] [--roles <csv>] [--priority P1|P2|P3] [--timeout-sec N] [--no-wait] <prompt>",
                "run usage",
                false,
            )
            .await;
            return Ok(());
        }
        p
    } else if resolved.cmd != Cmd::None {
        gw.send(
            turn,
            &format!("unknown command: /{}\n\n{}", resolved.cmd.key(), help_text()),
            "unknown command",
            true,
        )
        .await;
        return Ok(());
    } else {
        let p = text.trim().to_string();
        if p.is_empty() {
            gw.send(turn, "empty prompt", "empty prompt", false).await;
            return Ok(());
        }
        p
    };

    // Rate caps and the high-risk confirmation gate (explicit runs only).
    if is_run {
        let max_running = gw.cfg.chat_max_running;
        let daily_cap = gw.cfg.chat_daily_cap;
        let (running_count, submitted_today) = summarize_chat_usage(state, &turn.chat_id);

        if max_running > 0 && running_count >= max_running {
            gw.send(
                turn,
                &format!(
                    "rate limit: 동시 실행 한도를 초과했습니다.\n- running_now: {}\n- max_running: {}\nnext: /monitor 또는 /check 로 기존 작업을 확인하세요.",
                    running_count, max_running
                ),
                "rate-limit-running",
                true,
            )
            .await;
            gw.log_event(
                turn,
                "rate_limited",
                EventFields {
                    stage: "intake",
                    status: "rejected",
                    error_code: ERROR_GATE,
                    detail: &format!("type=running running_now={} max={}", running_count, max_running),
                    ..EventFields::default()
                },
            );
            return Ok(());
        }

        if daily_cap > 0 && submitted_today >= daily_cap {
            gw.send(
                turn,
                &format!(
                    "rate limit: 일일 실행 한도에 도달했습니다.\n- submitted_today: {}\n- daily_cap: {}\nnext: 내일 다시 시도하거나 cap 설정을 조정하세요.",
                    submitted_today, daily_cap
                ),
                "rate-limit-daily",
                true,
            )
            .await;
            gw.log_event(
                turn,
                "rate_limited",
                EventFields {
                    stage: "intake",
                    status: "rejected",
                    error_code: ERROR_GATE,
                    detail: &format!("type=daily submitted_today={} cap={}", submitted_today, daily_cap),
                    ..EventFields::default()
                },
            );
            return Ok(());
        }

        if resolved.run_auto_source == "default" {
            let risk = detect_high_risk_prompt(&prompt);
            if !risk.is_empty() {
                let mode = resolved.run_force_mode.unwrap_or(RunMode::Dispatch);
                state.set_confirm_action(
                    &turn.chat_id,
                    mode,
                    &prompt,
                    &risk,
                    resolved.orch_target.as_deref().unwrap_or(""),
                );
                gw.persist(state);
                gw.send(
                    turn,
                    &format!(
                        "고위험 자동실행 감지: 확인이 필요합니다.\n- risk: {}\n- mode: {}\n- preview: {}\n실행: /ok\n취소: /cancel",
                        risk,
                        mode.as_str(),
                        prompt.chars().take(160).collect::<String>()
                    ),
                    "confirm-required",
                    true,
                )
                .await;
                gw.log_event(
                    turn,
                    "confirm_required",
                    EventFields {
                        stage: "intake",
                        status: "pending",
                        detail: &format!(
                            "risk={} mode={} auto_source={}",
                            risk,
                            mode.as_str(),
                            resolved.run_auto_source
                        ),
                        ..EventFields::default()
                    },
                );
                return Ok(());
            }
        }
    }

    let (key, paths) = gw.get_context(turn, state, resolved.orch_target.as_deref())?;

    let (dispatch_mode, dispatch_roles) = resolve_dispatch_mode_and_roles(
        resolved.run_force_mode,
        resolved.run_roles_override.as_deref(),
        &gw.cfg.roles,
        gw.cfg.auto_dispatch,
        &prompt,
    );

    let verifier_candidates = resolve_verifier_candidates(&gw.cfg.verifier_roles);
    let available_roles = load_orchestrator_roles(&paths.team_dir);
    let selected_roles = parse_roles_csv(&dispatch_roles);

    let plan = compute_dispatch_plan(
        gw,
        &paths,
        &prompt,
        dispatch_mode,
        &run_transition.run_control_mode,
        run_transition.run_source_task.as_ref(),
        selected_roles,
        &available_roles,
    )
    .await;

    let mut selected_roles = plan.selected_roles.clone();
    let mut dispatch_roles = dispatch_roles;
    let mut verifier_roles: Vec<String> = Vec::new();
    let mut verifier_added = false;

    if dispatch_mode {
        let (next_selected, next_verifiers, added, _available_verifiers) =
            ensure_verifier_roles(&selected_roles, &available_roles, &verifier_candidates);
        selected_roles = next_selected;
        verifier_roles = next_verifiers;
        verifier_added = added;
        dispatch_roles = selected_roles.join(",");

        if gw.cfg.require_verifier && verifier_roles.is_empty() {
            gw.send(
                turn,
                &format!(
                    "error: verifier gate enabled but no verifier role is available.\nrequired_candidates={}\nproject_roles={}\nhint: add a verifier role (e.g. Reviewer) or disable gate with --no-require-verifier",
                    if verifier_candidates.is_empty() { "-".to_string() } else { verifier_candidates.join(", ") },
                    if available_roles.is_empty() { "-".to_string() } else { available_roles.join(", ") },
                ),
                "verifier-gate setup",
                false,
            )
            .await;
            return Ok(());
        }

        if plan.plan_gate_blocked {
            gw.send(
                turn,
                &format!(
                    "plan gate blocked: critic issues remain after auto-replan.\nreason: {}\nhint: 요청을 더 구체화하거나 역할/범위를 줄여 다시 실행하세요.\nreplan_attempts: {}",
                    if plan.plan_gate_reason.is_empty() { "unresolved issues" } else { plan.plan_gate_reason.as_str() },
                    plan.plan_replans.len()
                ),
                "planning-gate",
                false,
            )
            .await;
            return Ok(());
        }
    }

    let effective_priority = resolved
        .run_priority_override
        .clone()
        .unwrap_or_else(|| gw.cfg.priority.clone());
    let effective_timeout = resolved
        .run_timeout_override
        .map(|t| t.max(1) as u64)
        .unwrap_or(gw.cfg.orch_timeout_sec);
    let effective_no_wait = resolved.run_no_wait_override.unwrap_or(gw.cfg.no_wait);

    if gw.cfg.dry_run {
        let plan_subtasks = plan.plan_data.as_ref().map(|p| p.subtasks.len()).unwrap_or(0);
        let preview = format!(
            "[DRY-RUN] orch={} mode: {}\n- prompt: {}\n- roles: {}\n- verifier_required: {}\n- verifier_roles: {}\n- verifier_auto_added: {}\n- control_mode: {}\n- source_request_id: {}\n- task_planning: {}\n- plan_reused: {}\n- plan_subtasks: {}\n- plan_replans: {}\n- plan_gate_blocked: {}\n- plan_error: {}\n- priority: {}\n- timeout: {}s\n- no_wait: {}",
            key,
            if dispatch_mode { "dispatch" } else { "direct" },
            prompt,
            if dispatch_roles.is_empty() { "-" } else { dispatch_roles.as_str() },
            if gw.cfg.require_verifier { "yes" } else { "no" },
            if verifier_roles.is_empty() { "-".to_string() } else { verifier_roles.join(", ") },
            if verifier_added { "yes" } else { "no" },
            if run_transition.run_control_mode.is_empty() { "normal" } else { run_transition.run_control_mode.as_str() },
            if run_transition.run_source_request_id.is_empty() { "-" } else { run_transition.run_source_request_id.as_str() },
            if plan.planning_enabled { "yes" } else { "no" },
            if plan.reuse_source_plan && plan.plan_data.is_some() { "yes" } else { "no" },
            plan_subtasks,
            plan.plan_replans.len(),
            if plan.plan_gate_blocked { "yes" } else { "no" },
            if plan.plan_error.is_empty() { "-" } else { plan.plan_error.as_str() },
            effective_priority,
            effective_timeout,
            if effective_no_wait { "yes" } else { "no" },
        );
        gw.send(turn, &preview, "dry-run", false).await;
        return Ok(());
    }

    if !dispatch_mode {
        let direct_reply = run_orchestrator_direct(gw, &paths, &prompt).await?;
        gw.send(turn, &direct_reply, "direct", false).await;
        gw.log_event(
            turn,
            "direct_reply",
            EventFields {
                project: &key,
                stage: "close",
                status: "completed",
                ..EventFields::default()
            },
        );
        return Ok(());
    }

    let dispatch_prompt = match &plan.plan_data {
        Some(plan_data) => build_planned_dispatch_prompt(&prompt, plan_data, &plan.plan_critic),
        None => prompt.clone(),
    };

    let run_opts = OrchRunOptions {
        priority: effective_priority,
        timeout_sec: effective_timeout,
        poll_sec: gw.cfg.orch_poll_sec,
        roles_csv: dispatch_roles.clone(),
        no_spawn_missing: gw.cfg.no_spawn_missing,
        no_wait: effective_no_wait,
        chat_id: turn.chat_id.clone(),
    };
    let snapshot = gw.orch.clone().run(&paths, &dispatch_prompt, &run_opts).await?;

    let req_id = snapshot
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    if !req_id.is_empty() {
        if let Some(entry) = state.project_mut(&key) {
            entry.last_request_id = req_id.clone();
        }
        state.touch_recent_task_ref(&turn.chat_id, &key, &req_id);
        state.set_selected_task_ref(&turn.chat_id, &key, &req_id);
    }
    if let Some(entry) = state.project_mut(&key) {
        entry.touch();
    }

    let synced_rid = {
        let entry = state.project_mut(&key).expect("resolved project");
        sync_task_lifecycle(
            entry,
            &snapshot,
            SyncInputs {
                prompt: &prompt,
                mode: RunMode::Dispatch,
                selected_roles: Some(&selected_roles),
                verifier_roles: Some(&verifier_roles),
                require_verifier: gw.cfg.require_verifier,
                verifier_candidates: &verifier_candidates,
            },
        )
    };

    if let Some(rid) = &synced_rid {
        if let Some(task) = state.project_mut(&key).and_then(|e| e.tasks.get_mut(rid)) {
            task.initiator_chat_id = turn.chat_id.clone();
            task.updated_at = now_iso();
        }
        apply_plan_and_lineage(state, &key, rid, &plan, run_transition);
    }

    gw.persist(state);

    let task = synced_rid
        .as_deref()
        .and_then(|rid| state.project(&key).and_then(|e| e.task(rid)))
        .cloned();
    send_dispatch_result(gw, turn, &key, &paths, &prompt, &snapshot, &req_id, task.as_ref(), run_transition).await;
    Ok(())
}

/// Attaches plan metadata and retry/replan lineage to the synced task; the
/// parent task's child list is updated through the store.
fn apply_plan_and_lineage(
    state: &mut ManagerState,
    key: &str,
    rid: &str,
    plan: &PlanOutcome,
    run_transition: &RunTransitionState,
) {
    let control_mode = run_transition.run_control_mode.as_str();
    let source_request_id = run_transition.run_source_request_id.trim().to_string();

    if let Some(task) = state.project_mut(key).and_then(|e| e.tasks.get_mut(rid)) {
        if let Some(plan_data) = &plan.plan_data {
            task.plan = Some(plan_data.clone());
            task.plan_critic = Some(plan.plan_critic.clone());
            task.plan_roles = plan.plan_roles.clone();
            task.plan_replans = plan.plan_replans.clone();
            task.plan_gate_passed = Some(!critic_has_blockers(&plan.plan_critic));
            let note = format!(
                "subtasks={} critic={} replans={}",
                plan_data.subtasks.len(),
                if critic_has_blockers(&plan.plan_critic) { "issues" } else { "ok" },
                plan.plan_replans.len()
            );
            lifecycle_set_stage(task, Stage::Planning, StageStatus::Done, &note);
        } else if !plan.plan_error.is_empty() {
            lifecycle_set_stage(
                task,
                Stage::Planning,
                StageStatus::Done,
                &format!("fallback_no_plan: {}", plan.plan_error),
            );
        }

        if matches!(control_mode, "retry" | "replan") && !source_request_id.is_empty() {
            task.source_request_id = Some(source_request_id.clone());
            task.control_mode = Some(control_mode.to_string());
            if control_mode == "retry" {
                task.retry_of = Some(source_request_id.clone());
            } else {
                task.replan_of = Some(source_request_id.clone());
            }
            lifecycle_set_stage(
                task,
                Stage::Intake,
                StageStatus::Done,
                &format!("{}_of={}", control_mode, source_request_id),
            );
        }
    }

    if matches!(control_mode, "retry" | "replan") && !source_request_id.is_empty() {
        let lineage_ts = now_iso();
        if let Some(parent) = state.project_mut(key).and_then(|e| e.tasks.get_mut(&source_request_id)) {
            let children = if control_mode == "retry" {
                &mut parent.retry_children
            } else {
                &mut parent.replan_children
            };
            TaskRecord::push_child(children, rid);
            parent.updated_at = lineage_ts;
        }
    }
}

/// Reply ladder: verifier-gate failure → synthesis → rendered fallback.
#[allow(clippy::too_many_arguments)]
async fn send_dispatch_result(
    gw: &Gateway,
    turn: &Turn,
    key: &str,
    paths: &ProjectPaths,
    prompt: &str,
    snapshot: &Value,
    req_id: &str,
    task: Option<&TaskRecord>,
    run_transition: &RunTransitionState,
) {
    let control_detail = format!(
        "control_mode={} source_request_id={}",
        if run_transition.run_control_mode.is_empty() { "normal" } else { run_transition.run_control_mode.as_str() },
        if run_transition.run_source_request_id.is_empty() { "-" } else { run_transition.run_source_request_id.as_str() },
    );

    if let Some(task) = task {
        if gw.cfg.require_verifier && task.stages.verification == StageStatus::Failed {
            gw.send(turn, &summarize_task_lifecycle(key, task), "verifier-gate failed", false).await;
            gw.log_event(
                turn,
                "dispatch_failed",
                EventFields {
                    project: key,
                    request_id: req_id,
                    task: Some(task),
                    stage: "verification",
                    status: "failed",
                    error_code: ERROR_GATE,
                    detail: "verifier_gate_failed",
                },
            );
            return;
        }
    }

    let complete = snapshot.get("complete").and_then(Value::as_bool).unwrap_or(false);
    let has_replies = snapshot
        .get("replies")
        .and_then(Value::as_array)
        .map(|r| !r.is_empty())
        .unwrap_or(false);

    if complete && has_replies {
        if let Ok(synth) = synthesize_orchestrator_response(gw, paths, prompt, snapshot).await {
            gw.send(turn, &synth, "synth", false).await;
            gw.log_event(
                turn,
                "dispatch_completed",
                EventFields {
                    project: key,
                    request_id: req_id,
                    task,
                    stage: task.map(|t| t.stage.as_str()).unwrap_or("close"),
                    status: task.map(|t| t.status.as_str()).unwrap_or("completed"),
                    detail: &control_detail,
                    ..EventFields::default()
                },
            );
            return;
        }
    }

    gw.send(turn, &render_run_response(snapshot, task), "result", false).await;
    gw.log_event(
        turn,
        "dispatch_result",
        EventFields {
            project: key,
            request_id: req_id,
            task,
            stage: task.map(|t| t.stage.as_str()).unwrap_or("close"),
            status: task
                .map(|t| t.status.as_str())
                .unwrap_or(if complete { "completed" } else { "running" }),
            detail: &control_detail,
            ..EventFields::default()
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_direct_never_dispatches() {
        let (mode, roles) =
            resolve_dispatch_mode_and_roles(Some(RunMode::Direct), Some("A,B"), "C", true, "review the data");
        assert!(!mode);
        assert!(roles.is_empty());
    }

    #[test]
    fn forced_dispatch_defaults_to_reviewer() {
        let (mode, roles) = resolve_dispatch_mode_and_roles(Some(RunMode::Dispatch), None, "", false, "hello");
        assert!(mode);
        assert_eq!(roles, "Reviewer");
    }

    #[test]
    fn forced_dispatch_prefers_explicit_then_auto_roles() {
        let (_, roles) = resolve_dispatch_mode_and_roles(Some(RunMode::Dispatch), Some("A"), "", true, "data work");
        assert_eq!(roles, "A");
        let (_, roles) = resolve_dispatch_mode_and_roles(Some(RunMode::Dispatch), None, "", true, "data work");
        assert_eq!(roles, "DataEngineer");
    }

    #[test]
    fn roles_csv_implies_dispatch() {
        let (mode, roles) = resolve_dispatch_mode_and_roles(None, Some("A,B"), "", false, "hello");
        assert!(mode);
        assert_eq!(roles, "A,B");
    }

    #[test]
    fn project_roles_used_when_override_absent() {
        let (mode, roles) = resolve_dispatch_mode_and_roles(None, None, "C", false, "hello");
        assert!(mode);
        assert_eq!(roles, "C");
    }

    #[test]
    fn auto_dispatch_keyword_classification() {
        let (mode, roles) = resolve_dispatch_mode_and_roles(None, None, "", true, "review the risk");
        assert!(mode);
        assert_eq!(roles, "Reviewer");
        let (mode, roles) = resolve_dispatch_mode_and_roles(None, None, "", true, "write a poem");
        assert!(!mode);
        assert!(roles.is_empty());
    }
}
