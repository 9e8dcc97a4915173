//! User-facing reply bodies: help, boards, lifecycle and progress summaries,
//! cancel results and dry-run previews.

use serde_json::Value;

use crate::lifecycle::extract_request_snapshot;
use crate::plan::critic_has_blockers;
use crate::store::{
    dedupe_roles, task_display_label, ManagerState, ProjectEntry, TaskRecord, LIFECYCLE_STAGES,
};

pub fn help_text() -> String {
    concat!(
        "AOE Telegram Gateway commands\n",
        "Quick mode (slash-only default)\n",
        "- /status /check /task /monitor /kpi /help\n",
        "- /mode [on|off|direct]\n",
        "- /on /off\n",
        "- /ok (고위험 자동실행 확인)\n",
        "- /whoami /lockme\n",
        "- /acl /grant /revoke\n",
        "- /pick <번호|task_label>\n",
        "- /dispatch <요청>   (서브에이전트 배정)\n",
        "- /direct <질문>     (오케스트레이터 직접 답변)\n",
        "- /dispatch 또는 /direct만 입력하면 다음 메시지 1회 모드\n",
        "- /cancel (대기 모드 해제)\n",
        "\n",
        "Slash mode\n",
        "- /help\n",
        "- /status\n",
        "- /mode [on|off|direct|dispatch]\n",
        "- /on /off\n",
        "- /ok\n",
        "- /acl\n",
        "- /grant <allow|admin|readonly> <chat_id|alias>\n",
        "- /revoke <allow|admin|readonly|all> <chat_id|alias>\n",
        "- /kpi [hours]\n",
        "- /pick <number|request_or_alias>\n",
        "- /cancel [request_or_alias]\n",
        "- /retry <request_or_alias>\n",
        "- /replan <request_or_alias>\n",
        "- /request <request_or_alias>\n",
        "- /run <prompt>\n",
        "\n",
        "CLI mode\n",
        "- aoe status\n",
        "- aoe mode [on|off|direct|dispatch]\n",
        "- aoe on | aoe off\n",
        "- aoe ok\n",
        "- aoe acl\n",
        "- aoe grant <allow|admin|readonly> <chat_id|alias>\n",
        "- aoe revoke <allow|admin|readonly|all> <chat_id|alias>\n",
        "- aoe kpi [hours]\n",
        "- aoe monitor [limit]\n",
        "- aoe pick <number|request_or_alias>\n",
        "- aoe cancel [request_or_alias]\n",
        "- aoe retry <request_or_alias>\n",
        "- aoe replan <request_or_alias>\n",
        "- aoe request <request_or_alias>\n",
        "- aoe run [--direct|--dispatch] [--roles <csv>] [--priority P1|P2|P3] [--timeout-sec N] [--no-wait] <prompt>\n",
        "- aoe add-role <Role> [--provider <name>] [--launch <cmd>] [--spawn|--no-spawn]\n",
        "\n",
        "Orch Manager\n",
        "- aoe orch list\n",
        "- aoe orch use <name>\n",
        "- aoe orch add <name> --path <project_root> [--overview <text>] [--init|--no-init] [--spawn|--no-spawn]\n",
        "- aoe orch status [--orch <name>]\n",
        "- aoe orch kpi [--orch <name>] [--hours <n>]\n",
        "- aoe orch monitor [--orch <name>] [--limit <n>]\n",
        "- aoe orch run [--orch <name>] [--direct|--dispatch] [--roles <csv>] [--priority P1|P2|P3] [--timeout-sec N] [--no-wait] <prompt>\n",
        "- aoe orch check [--orch <name>] [<request_or_alias>]   # 3단계 진행확인\n",
        "- aoe orch task [--orch <name>] [<request_or_alias>]    # lifecycle 상태\n",
        "- aoe orch pick [--orch <name>] <number|request_or_alias>\n",
        "- aoe orch cancel [--orch <name>] [<request_or_alias>]\n",
        "- aoe orch retry [--orch <name>] <request_or_alias>\n",
        "- aoe orch replan [--orch <name>] <request_or_alias>\n",
        "\n",
        "Routing\n",
        "- default: slash-only (plain text ignored unless pending/default mode)\n",
        "- default access: deny-by-default (allowlist required)\n",
        "- bootstrap: when allowlist is empty, only /lockme|/whoami|/help is accepted\n",
        "- owner gate: /lockme /grant /revoke are owner-only when TELEGRAM_OWNER_CHAT_ID is set\n",
        "- dispatch only when explicit (--dispatch or --roles)\n",
        "- auto dispatch: disabled by default (enable with --auto-dispatch)\n",
        "- force dispatch: --dispatch\n",
        "- force direct: --direct\n",
        "- slash-only default: enabled (disable with --no-slash-only)\n",
        "- verifier gate: on by default (disable with --no-require-verifier)\n",
        "- task planning: on by default (disable with --no-task-planning)\n",
        "- planning gate: auto-replan + block on critic issues by default\n",
    )
    .to_string()
}

/// Latest-N task board plus the alias map and quick actions.
pub fn summarize_task_monitor(project_name: &str, entry: &ProjectEntry, limit: usize) -> String {
    if entry.tasks.is_empty() {
        return format!("orch: {}\n작업이 없습니다.", project_name);
    }

    let mut rows: Vec<(&String, &TaskRecord)> = entry.tasks.iter().collect();
    rows.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at));
    let cap = limit.clamp(1, 50);

    let mut counts = std::collections::BTreeMap::new();
    for (_, task) in &rows {
        *counts.entry(task.status.as_str()).or_insert(0usize) += 1;
    }

    let mut lines = vec![
        format!("orch: {}", project_name),
        format!("task monitor: latest {}", cap),
        "format: label | status/stage | roles | updated".to_string(),
        format!(
            "summary: total={} running={} completed={} failed={} pending={}",
            rows.len(),
            counts.get("running").copied().unwrap_or(0),
            counts.get("completed").copied().unwrap_or(0),
            counts.get("failed").copied().unwrap_or(0),
            counts.get("pending").copied().unwrap_or(0),
        ),
    ];

    for (idx, (req_id, task)) in rows.iter().take(cap).enumerate() {
        let label = task_display_label(Some(task), req_id);
        let roles = dedupe_roles(task.roles.iter().map(String::as_str));
        let mut role_text = roles.iter().take(2).cloned().collect::<Vec<_>>().join(", ");
        if roles.len() > 2 {
            role_text.push_str(&format!(" +{}", roles.len() - 2));
        }
        let updated = if task.updated_at.trim().is_empty() { "-" } else { task.updated_at.trim() };
        lines.push(format!(
            "- {}. {} | {}/{} | {} | {}",
            idx + 1,
            label,
            task.status.as_str(),
            task.stage.as_str(),
            if role_text.is_empty() { "-" } else { role_text.as_str() },
            updated
        ));
    }

    lines.push(String::new());
    lines.push("alias map (number/label -> request_id):".to_string());
    for (idx, (req_id, task)) in rows.iter().take(cap).enumerate() {
        lines.push(format!("- {}. {} -> {}", idx + 1, task_display_label(Some(task), req_id), req_id));
    }
    lines.push(String::new());
    lines.push(
        "quick actions: /check <번호|label> /task <번호|label> /retry <번호|label> /replan <번호|label> /cancel <번호|label>"
            .to_string(),
    );

    lines.join("\n")
}

/// Full lifecycle detail for one task, including plan and critic metadata.
pub fn summarize_task_lifecycle(project_name: &str, task: &TaskRecord) -> String {
    let request_id = if task.request_id.trim().is_empty() { "-" } else { task.request_id.trim() };
    let label = task_display_label(Some(task), request_id);
    let roles = dedupe_roles(task.roles.iter().map(String::as_str));
    let verifiers = dedupe_roles(task.verifier_roles.iter().map(String::as_str));

    let mut lines = vec![
        format!("orch: {}", project_name),
        format!("task: {}", label),
        format!("request_id: {}", request_id),
        format!("status: {}", task.status.as_str()),
        format!("mode: {}", task.mode.as_str()),
        format!("roles: {}", if roles.is_empty() { "-".to_string() } else { roles.join(", ") }),
        format!(
            "verifier_roles: {}",
            if verifiers.is_empty() { "-".to_string() } else { verifiers.join(", ") }
        ),
        "lifecycle:".to_string(),
    ];
    for stage in LIFECYCLE_STAGES {
        lines.push(format!("- {}: {}", stage.as_str(), task.stages.get(stage).as_str()));
    }

    if let Some(plan) = &task.plan {
        if !plan.summary.trim().is_empty() {
            lines.push(format!("plan_summary: {}", plan.summary.trim()));
        }
        lines.push(format!("plan_subtasks: {}", plan.subtasks.len()));

        let mut owner_counts: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
        for row in &plan.subtasks {
            let role = if row.owner_role.trim().is_empty() { "Worker" } else { row.owner_role.trim() };
            *owner_counts.entry(role.to_string()).or_insert(0) += 1;
        }
        if !owner_counts.is_empty() {
            let load = owner_counts
                .iter()
                .map(|(role, cnt)| format!("{}={}", role, cnt))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("plan_owner_load: {}", load));
        }

        for row in plan.subtasks.iter().take(6) {
            let sid = if row.id.trim().is_empty() { "S" } else { row.id.trim() };
            let role = if row.owner_role.trim().is_empty() { "Worker" } else { row.owner_role.trim() };
            let title = if !row.title.trim().is_empty() {
                row.title.trim()
            } else if !row.goal.trim().is_empty() {
                row.goal.trim()
            } else {
                "subtask"
            };
            lines.push(format!("- plan {} [{}] {}", sid, role, title));
        }
    }

    if let Some(critic) = &task.plan_critic {
        let approved = !critic_has_blockers(critic);
        lines.push(format!("plan_critic: {}", if approved { "approved" } else { "needs_fix" }));
        for item in critic.issues.iter().take(4) {
            if !item.trim().is_empty() {
                lines.push(format!("- issue: {}", item.trim()));
            }
        }
        for item in critic.recommendations.iter().take(4) {
            if !item.trim().is_empty() {
                lines.push(format!("- recommendation: {}", item.trim()));
            }
        }
    }

    if let Some(gate) = task.plan_gate_passed {
        lines.push(format!("plan_gate: {}", if gate { "passed" } else { "blocked" }));
    }

    if !task.plan_replans.is_empty() {
        lines.push(format!("plan_replans: {}", task.plan_replans.len()));
        let start = task.plan_replans.len().saturating_sub(3);
        for row in &task.plan_replans[start..] {
            lines.push(format!(
                "- replan#{}: critic={} subtasks={}",
                row.attempt,
                if row.critic.trim().is_empty() { "unknown" } else { row.critic.trim() },
                row.subtasks
            ));
        }
    }

    let result = &task.result;
    if result.assignments > 0 || result.replies > 0 || result.complete {
        lines.push(format!(
            "summary: assignments={} replies={} complete={}",
            result.assignments,
            result.replies,
            if result.complete { "yes" } else { "no" }
        ));
        if !result.failed_roles.is_empty() {
            lines.push(format!("failed_roles: {}", result.failed_roles.join(", ")));
        }
        if !result.pending_roles.is_empty() {
            lines.push(format!("pending_roles: {}", result.pending_roles.join(", ")));
        }
    }

    if !task.history.is_empty() {
        lines.push("recent:".to_string());
        let start = task.history.len().saturating_sub(6);
        for ev in &task.history[start..] {
            let mut row = format!("- {} {}:{}", ev.at, ev.stage.as_str(), ev.status.as_str());
            if let Some(note) = &ev.note {
                row.push_str(&format!(" ({})", note));
            }
            lines.push(row);
        }
    }

    lines.join("\n")
}

/// Three-stage progress view over a raw snapshot (접수/배정, 실행, 완료/회신).
pub fn summarize_three_stage_request(project_name: &str, request_data: &Value, task: Option<&TaskRecord>) -> String {
    let request_id = request_data
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or("-")
        .trim()
        .to_string();
    let request_id = if request_id.is_empty() { "-".to_string() } else { request_id };
    let counts = request_data.get("counts").cloned().unwrap_or(Value::Null);
    let assignments = counts.get("assignments").and_then(Value::as_i64).unwrap_or(0);
    let replies = counts.get("replies").and_then(Value::as_i64).unwrap_or(0);
    let complete = request_data.get("complete").and_then(Value::as_bool).unwrap_or(false);

    let mut running: Vec<String> = Vec::new();
    let mut failed: Vec<String> = Vec::new();
    let mut done: Vec<String> = Vec::new();
    if let Some(roles) = request_data.get("roles").and_then(Value::as_array) {
        for row in roles {
            let role = row.get("role").and_then(Value::as_str).unwrap_or("?").trim().to_string();
            let role = if role.is_empty() { "?".to_string() } else { role };
            let status = row
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .trim()
                .to_lowercase();
            let item = format!("{}({})", role, status);
            match status.as_str() {
                "done" => done.push(item),
                "failed" | "error" | "fail" => failed.push(item),
                _ => running.push(item),
            }
        }
    }

    let stage1 = if assignments > 0 { "완료" } else { "대기" };
    let stage2 = if !failed.is_empty() {
        "이슈"
    } else if !running.is_empty() {
        "진행중"
    } else if assignments > 0 {
        "완료"
    } else {
        "대기"
    };
    let stage3 = if complete && failed.is_empty() {
        "완료"
    } else if replies > 0 {
        "부분완료"
    } else {
        "대기"
    };

    let mut lines = vec![
        format!("orch: {}", project_name),
        format!("task: {}", task_display_label(task, &request_id)),
        format!("request_id: {}", request_id),
        "3단계 진행확인".to_string(),
        format!("1) 접수/배정: {} (assignments={})", stage1, assignments),
        {
            let mut row = format!("2) 실행: {}", stage2);
            if !running.is_empty() {
                row.push_str(&format!(" | running={}", running.join(", ")));
            }
            row
        },
        format!(
            "3) 완료/회신: {} (replies={}, complete={})",
            stage3,
            replies,
            if complete { "yes" } else { "no" }
        ),
    ];

    if !done.is_empty() {
        lines.push(format!("done: {}", done.join(", ")));
    }
    if !failed.is_empty() {
        lines.push(format!("failed: {}", failed.join(", ")));
    }
    if let Some(unresolved) = request_data.get("unresolved_roles").and_then(Value::as_array) {
        let items: Vec<String> = unresolved
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        if !items.is_empty() {
            lines.push(format!("unresolved: {}", items.join(", ")));
        }
    }

    lines.join("\n")
}

/// Raw request snapshot view for `/request`.
pub fn summarize_request_state(request_data: &Value, task: Option<&TaskRecord>) -> String {
    let request_id = request_data
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or("-")
        .to_string();
    let counts = request_data.get("counts").cloned().unwrap_or(Value::Null);

    let mut lines = vec![
        format!("task: {}", task_display_label(task, &request_id)),
        format!("request_id: {}", request_id),
        format!(
            "counts: messages={} assignments={} replies={}",
            counts.get("messages").and_then(Value::as_i64).unwrap_or(0),
            counts.get("assignments").and_then(Value::as_i64).unwrap_or(0),
            counts.get("replies").and_then(Value::as_i64).unwrap_or(0),
        ),
        format!(
            "complete: {}",
            if request_data.get("complete").and_then(Value::as_bool).unwrap_or(false) {
                "yes"
            } else {
                "no"
            }
        ),
    ];

    if let Some(roles) = request_data.get("roles").and_then(Value::as_array) {
        if !roles.is_empty() {
            lines.push(String::new());
            lines.push("roles".to_string());
            for row in roles {
                lines.push(format!(
                    "- {}: {} {}",
                    row.get("role").and_then(Value::as_str).unwrap_or(""),
                    row.get("status").and_then(Value::as_str).unwrap_or(""),
                    row.get("message_id").and_then(Value::as_str).unwrap_or(""),
                ));
            }
        }
    }

    if let Some(unresolved) = request_data.get("unresolved_roles").and_then(Value::as_array) {
        let items: Vec<String> = unresolved
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        if !items.is_empty() {
            lines.push(String::new());
            lines.push(format!("unresolved: {}", items.join(", ")));
        }
    }

    lines.join("\n")
}

/// Default run reply: agent bodies when complete, a 접수됨 placeholder while
/// still running.
pub fn render_run_response(request_data: &Value, task: Option<&TaskRecord>) -> String {
    let snap = extract_request_snapshot(request_data);
    let request_id = if snap.request_id.is_empty() { "-".to_string() } else { snap.request_id.clone() };
    let label = task_display_label(task, &request_id);

    let mut rendered: Vec<(String, String)> = Vec::new();
    if let Some(replies) = request_data.get("replies").and_then(Value::as_array) {
        for item in replies {
            let role = item
                .get("role")
                .or_else(|| item.get("from"))
                .and_then(Value::as_str)
                .unwrap_or("assistant")
                .trim()
                .to_string();
            let role = if role.is_empty() { "assistant".to_string() } else { role };
            let body = item.get("body").and_then(Value::as_str).unwrap_or_default().trim().to_string();
            if !body.is_empty() {
                rendered.push((role, body));
            }
        }
    }

    if snap.complete && !rendered.is_empty() {
        if rendered.len() == 1 {
            return rendered[0].1.clone();
        }
        let mut lines: Vec<String> = Vec::new();
        for (role, body) in rendered.iter().take(6) {
            lines.push(format!("[{}]", role));
            lines.push(body.clone());
            lines.push(String::new());
        }
        return lines.join("\n").trim().to_string();
    }

    if !snap.complete {
        return format!("작업 접수됨: {}\n진행: 진행 {}\n상세: 상세 {}", label, label, label);
    }

    format!("작업 완료: {}\n(에이전트 본문 응답이 아직 없습니다)", label)
}

/// Cancellation outcome assembled by the cancel handler.
#[derive(Debug, Clone, Default)]
pub struct CancelOutcome {
    pub request_id: String,
    pub targets: usize,
    pub canceled: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

pub fn summarize_cancel_result(
    project_name: &str,
    request_id: &str,
    task: Option<&TaskRecord>,
    result: &CancelOutcome,
) -> String {
    let label = task_display_label(task, request_id);
    let mut lines = vec![
        format!("orch: {}", project_name),
        format!("task: {}", label),
        format!("request_id: {}", request_id),
        format!(
            "cancel: targets={} canceled={} failed={} skipped={}",
            result.targets,
            result.canceled.len(),
            result.failed.len(),
            result.skipped.len()
        ),
    ];
    if !result.canceled.is_empty() {
        lines.push(format!(
            "canceled_roles: {}",
            result.canceled.iter().take(6).cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    if !result.failed.is_empty() {
        lines.push(format!(
            "cancel_failures: {}",
            result.failed.iter().take(4).cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    if !result.skipped.is_empty() {
        lines.push(format!(
            "skipped: {}",
            result.skipped.iter().take(6).cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    lines.join("\n")
}

/// Project registry for `aoe orch list`.
pub fn summarize_orch_registry(state: &ManagerState) -> String {
    if state.projects.is_empty() {
        return "orch registry empty".to_string();
    }
    let active = crate::store::normalize_project_name(&state.active);
    let mut lines = vec![format!("active: {}", active), "projects:".to_string()];
    for (key, entry) in &state.projects {
        let marker = if *key == active { "*" } else { "-" };
        let last_req = entry.last_request_id.trim();
        let last_task_label = if last_req.is_empty() {
            "-".to_string()
        } else {
            match entry.task(last_req) {
                Some(task) => task_display_label(Some(task), last_req),
                None => last_req.to_string(),
            }
        };
        lines.push(format!(
            "{} {} | root={} | last_task={}",
            marker, key, entry.project_root, last_task_label
        ));
    }
    lines.join("\n")
}

/// Rendered `add-role` result from the orchestrator's JSON payload.
pub fn render_add_role_summary(data: &Value, role: &str, provider: Option<&str>, launch: Option<&str>) -> String {
    let r = data.get("role").and_then(Value::as_str).unwrap_or(role);
    let sess = data.get("session").and_then(Value::as_str).unwrap_or("");
    let prov = data
        .get("provider")
        .and_then(Value::as_str)
        .unwrap_or(provider.unwrap_or("codex"));
    let launch_used = data
        .get("launch")
        .and_then(Value::as_str)
        .unwrap_or(launch.unwrap_or(""));
    let exists = data.get("exists").and_then(Value::as_bool).unwrap_or(false);
    let updated = data.get("updated").and_then(Value::as_bool).unwrap_or(false);

    let mut lines = vec![format!("role ready: {}", r), format!("provider: {}", prov)];
    if !launch_used.is_empty() {
        lines.push(format!("launch: {}", launch_used));
    }
    if !sess.is_empty() {
        lines.push(format!("session: {}", sess));
    }
    lines.push(format!("exists_before: {}", if exists { "yes" } else { "no" }));
    lines.push(format!("updated: {}", if updated { "yes" } else { "no" }));

    let spawn_info = data.get("spawn_info").cloned().unwrap_or(Value::Null);
    let count = |key: &str| {
        spawn_info
            .get(key)
            .and_then(Value::as_array)
            .map(|a| a.len())
            .unwrap_or(0)
    };
    if count("spawned") > 0 {
        lines.push(format!("spawned: {}", count("spawned")));
    }
    if count("existing") > 0 {
        lines.push(format!("already_running: {}", count("existing")));
    }
    if count("failed") > 0 {
        lines.push(format!("spawn_failed: {}", count("failed")));
    }
    lines.join("\n")
}
