//! Run-path flows end to end against mock clients: dispatch + lifecycle
//! sync, verifier and plan gates, rate caps, the confirmation protocol,
//! retry/replan lineage and cancellation.

mod common;

use common::{harness, harness_with, write_orchestrator_roles, MockOrch, CHAT};
use gateway::llm::MockLlm;
use gateway::store::{load_manager_state, ManagerState, StageStatus, TaskStatus};
use serde_json::json;

fn joined(replies: &[String]) -> String {
    replies.join("\n---\n")
}

fn reload(h: &common::Harness) -> ManagerState {
    load_manager_state(&h.gw.cfg.manager_state_file, h.dir.path(), &h.gw.cfg.team_dir)
}

#[tokio::test]
async fn dispatch_completes_and_synthesizes_reply() {
    let mut h = harness(|_| {});
    let out = joined(&h.message("/dispatch 결측치 규칙 정리해줘").await);
    assert_eq!(out, "통합 응답", "complete runs go through the synthesis call");

    let state = reload(&h);
    let entry = state.project("default").unwrap();
    let task = entry.task("req-mock-1").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.stages.close, StageStatus::Done);
    assert_eq!(task.initiator_chat_id, CHAT);
    assert_eq!(task.short_id.as_deref(), Some("T-001"));
    assert_eq!(entry.last_request_id, "req-mock-1");
    assert_eq!(state.recent_task_refs(CHAT, "default"), vec!["req-mock-1"]);
    assert_eq!(state.selected_task_ref(CHAT, "default"), "req-mock-1");
}

#[tokio::test]
async fn dispatch_synthesis_failure_falls_back_to_rendered_reply() {
    let mut h = harness_with(MockOrch::completed("req-f-1"), MockLlm::failing(), |_| {});
    let out = joined(&h.message("/dispatch 정리해줘").await);
    assert!(out.contains("데이터 정리 완료"), "fallback renders the agent bodies: {}", out);
}

#[tokio::test]
async fn incomplete_dispatch_reports_accepted_placeholder() {
    let orch = MockOrch::with_snapshot(json!({
        "request_id": "req-r-1",
        "roles": [{"role": "Reviewer", "status": "working", "message_id": "m1"}],
        "counts": {"assignments": 1, "replies": 0},
        "complete": false,
        "replies": [],
    }));
    let mut h = harness_with(orch, MockLlm::with_reply("x"), |_| {});
    let out = joined(&h.message("/dispatch 오래 걸리는 작업").await);
    assert!(out.contains("작업 접수됨"));
    let state = reload(&h);
    let task = state.project("default").unwrap().task("req-r-1").unwrap();
    assert_eq!(task.status, TaskStatus::Running);
}

#[tokio::test]
async fn verifier_gate_rejects_when_no_candidate_available() {
    let mut h = harness(|cfg| {
        cfg.require_verifier = true;
    });
    // no orchestrator.json → no available roles → no verifier candidates
    let out = joined(&h.message("/dispatch 검증이 필요한 작업").await);
    assert!(out.contains("verifier gate enabled but no verifier role is available"));
}

#[tokio::test]
async fn verifier_auto_added_from_project_roles() {
    let mut h = harness(|cfg| {
        cfg.require_verifier = true;
    });
    write_orchestrator_roles(&h.gw.cfg.team_dir, &["DataEngineer", "Reviewer"]);
    let out = joined(&h.message("/dispatch 데이터 정리").await);
    assert_eq!(out, "통합 응답");
    let state = reload(&h);
    let task = state.project("default").unwrap().task("req-mock-1").unwrap();
    assert!(task.verifier_roles.contains(&"Reviewer".to_string()));
    assert_eq!(task.stages.verification, StageStatus::Done);
}

#[tokio::test]
async fn verifier_failure_sends_lifecycle_summary_with_gate_error() {
    let orch = MockOrch::with_snapshot(json!({
        "request_id": "req-v-1",
        "roles": [
            {"role": "DataEngineer", "status": "done", "message_id": "m1"},
            {"role": "Reviewer", "status": "failed", "message_id": "m2"},
        ],
        "counts": {"assignments": 2, "replies": 1},
        "done_roles": ["DataEngineer"],
        "failed_roles": ["Reviewer"],
        "complete": true,
        "replies": [{"role": "DataEngineer", "body": "done"}],
    }));
    let mut h = harness_with(orch, MockLlm::with_reply("x"), |cfg| {
        cfg.require_verifier = true;
    });
    write_orchestrator_roles(&h.gw.cfg.team_dir, &["DataEngineer", "Reviewer"]);
    let out = joined(&h.message("/dispatch 검증 실패 시나리오").await);
    assert!(out.contains("lifecycle:"), "verifier failure sends the lifecycle summary: {}", out);
    assert!(out.contains("- verification: failed"));

    let log = std::fs::read_to_string(h.gw.cfg.team_dir.join("logs").join("gateway_events.jsonl")).unwrap();
    assert!(log.contains("dispatch_failed"));
    assert!(log.contains("E_GATE"));
}

#[tokio::test]
async fn planning_attaches_plan_and_roles() {
    let plan_json = r#"{"summary": "두 단계 계획", "subtasks": [
        {"id": "S1", "title": "수집", "goal": "데이터 수집", "owner_role": "DataEngineer", "acceptance": ["수집 완료"]},
        {"id": "S2", "title": "검토", "goal": "결과 검토", "owner_role": "Reviewer", "acceptance": ["검토 완료"]}
    ]}"#;
    let mut h = harness_with(MockOrch::completed("req-p-1"), MockLlm::with_reply(plan_json), |cfg| {
        cfg.task_planning = true;
        cfg.plan_block_on_critic = false;
    });
    write_orchestrator_roles(&h.gw.cfg.team_dir, &["DataEngineer", "Reviewer"]);
    h.message("/dispatch 계획이 필요한 작업").await;

    let state = reload(&h);
    let task = state.project("default").unwrap().task("req-p-1").unwrap();
    let plan = task.plan.as_ref().expect("plan stored on task");
    assert_eq!(plan.summary, "두 단계 계획");
    assert_eq!(plan.subtasks.len(), 2);
    assert_eq!(task.plan_roles, vec!["DataEngineer", "Reviewer"]);
    assert_eq!(task.plan_gate_passed, Some(true));
}

#[tokio::test]
async fn plan_gate_blocks_dispatch_when_critic_objects() {
    // The same reply serves planner, critic and repair calls: the critic JSON
    // parse finds approved=false with an issue, so blockers remain.
    let critic_json = r#"{"approved": false, "issues": ["scope too broad"], "recommendations": []}"#;
    let mut h = harness_with(MockOrch::completed("req-g-1"), MockLlm::with_reply(critic_json), |cfg| {
        cfg.task_planning = true;
        cfg.plan_auto_replan = false;
        cfg.plan_block_on_critic = true;
    });
    write_orchestrator_roles(&h.gw.cfg.team_dir, &["DataEngineer", "Reviewer"]);
    let out = joined(&h.message("/dispatch 모호한 요청").await);
    assert!(out.contains("plan gate blocked"));
    assert!(out.contains("scope too broad"));

    let state = reload(&h);
    assert!(
        state.project("default").unwrap().task("req-g-1").is_none(),
        "blocked dispatch never reaches the orchestrator"
    );
}

#[tokio::test]
async fn planning_failure_is_soft_without_gate() {
    let mut h = harness_with(MockOrch::completed("req-s-1"), MockLlm::failing(), |cfg| {
        cfg.task_planning = true;
        cfg.plan_block_on_critic = false;
    });
    write_orchestrator_roles(&h.gw.cfg.team_dir, &["Reviewer"]);
    let out = joined(&h.message("/dispatch 계획 실패 시나리오").await);
    assert!(!out.contains("plan gate blocked"), "planning failure must not block: {}", out);
    let state = reload(&h);
    let task = state.project("default").unwrap().task("req-s-1").unwrap();
    assert!(task
        .history
        .iter()
        .any(|ev| ev.note.as_deref().map(|n| n.starts_with("fallback_no_plan")).unwrap_or(false)));
}

#[tokio::test]
async fn running_cap_rejects_new_runs() {
    let mut h = harness(|cfg| {
        cfg.chat_max_running = 1;
    });
    // Park one running task owned by this chat.
    let orch = MockOrch::with_snapshot(json!({
        "request_id": "req-run-1",
        "roles": [{"role": "Reviewer", "status": "working", "message_id": "m1"}],
        "counts": {"assignments": 1, "replies": 0},
        "complete": false,
        "replies": [],
    }));
    h.orch = std::sync::Arc::new(orch);
    h.gw.orch = h.orch.clone();
    h.message("/dispatch 첫번째 작업").await;

    let out = joined(&h.message("/dispatch 두번째 작업").await);
    assert!(out.contains("rate limit"));
    assert!(out.contains("동시 실행 한도"));
    let log = std::fs::read_to_string(h.gw.cfg.team_dir.join("logs").join("gateway_events.jsonl")).unwrap();
    assert!(log.contains("rate_limited"));
    assert!(log.contains("type=running"));
}

#[tokio::test]
async fn daily_cap_rejects_new_runs() {
    let mut h = harness(|cfg| {
        cfg.chat_daily_cap = 1;
    });
    h.message("/dispatch 첫번째 작업").await;
    let out = joined(&h.message("/dispatch 두번째 작업").await);
    assert!(out.contains("일일 실행 한도"));
}

#[tokio::test]
async fn risk_prompt_requires_confirmation_then_ok_runs() {
    let mut h = harness(|_| {});
    h.message("/mode on").await;
    let out = joined(&h.message("rm -rf /tmp/demo").await);
    assert!(out.contains("고위험 자동실행 감지"));

    let state = reload(&h);
    let confirm = state.confirm_action(CHAT).expect("confirmation stored");
    assert_eq!(confirm.risk, "destructive_delete");
    assert_eq!(confirm.prompt, "rm -rf /tmp/demo");

    // /ok redeems the token and dispatches the stored prompt.
    let out = joined(&h.message("/ok").await);
    assert_eq!(out, "통합 응답");
    let state = reload(&h);
    assert!(state.confirm_action(CHAT).is_none(), "token is single-use");
}

#[tokio::test]
async fn explicit_dispatch_bypasses_risk_gate() {
    let mut h = harness(|_| {});
    let out = joined(&h.message("/dispatch rm -rf /tmp/demo").await);
    assert_eq!(out, "통합 응답", "explicit slash runs skip the confirmation");
}

#[tokio::test]
async fn ok_without_pending_confirmation_explains() {
    let mut h = harness(|_| {});
    let out = joined(&h.message("/ok").await);
    assert!(out.contains("확인 대기 중인 실행이 없습니다"));
}

#[tokio::test]
async fn expired_confirmation_is_cleared_on_ok() {
    let mut h = harness(|_| {});
    h.message("/mode on").await;
    h.message("rm -rf /tmp/demo").await;

    // Age the stored token past the TTL.
    let mut state = reload(&h);
    if let Some(row) = state.chat_sessions.get_mut(CHAT) {
        if let Some(confirm) = row.confirm_action.as_mut() {
            confirm.requested_at = "2020-01-01T00:00:00+0000".to_string();
        }
    }
    gateway::store::save_manager_state(&h.gw.cfg.manager_state_file, &mut state).unwrap();

    let out = joined(&h.message("/ok").await);
    assert!(out.contains("확인 요청이 만료되었습니다"));
    let state = reload(&h);
    assert!(state.confirm_action(CHAT).is_none());
}

#[tokio::test]
async fn retry_reruns_source_task_and_records_lineage() {
    let mut h = harness(|_| {});
    h.message("/dispatch 원본 작업 실행").await;

    // The mock returns a fresh request id for the retry run.
    let retried = MockOrch::completed("req-mock-2");
    h.orch = std::sync::Arc::new(retried);
    h.gw.orch = h.orch.clone();

    let out = joined(&h.message("/retry req-mock-1").await);
    assert_eq!(out, "통합 응답");

    let state = reload(&h);
    let entry = state.project("default").unwrap();
    let child = entry.task("req-mock-2").expect("retry child recorded");
    assert_eq!(child.retry_of.as_deref(), Some("req-mock-1"));
    assert_eq!(child.control_mode.as_deref(), Some("retry"));
    assert_eq!(child.prompt, "원본 작업 실행");
    let parent = entry.task("req-mock-1").unwrap();
    assert_eq!(parent.retry_children, vec!["req-mock-2"]);
}

#[tokio::test]
async fn replan_records_replan_lineage() {
    let mut h = harness(|_| {});
    h.message("/dispatch 다시 계획할 작업").await;

    h.orch = std::sync::Arc::new(MockOrch::completed("req-mock-3"));
    h.gw.orch = h.orch.clone();

    let out = joined(&h.message("/replan req-mock-1").await);
    assert_eq!(out, "통합 응답");
    let state = reload(&h);
    let entry = state.project("default").unwrap();
    let child = entry.task("req-mock-3").unwrap();
    assert_eq!(child.replan_of.as_deref(), Some("req-mock-1"));
    assert_eq!(entry.task("req-mock-1").unwrap().replan_children, vec!["req-mock-3"]);
}

#[tokio::test]
async fn retry_without_target_or_selection_shows_usage() {
    let mut h = harness(|_| {});
    let out = joined(&h.message("/retry").await);
    assert!(out.contains("usage: /retry"));
}

#[tokio::test]
async fn cancel_fails_pending_assignments_and_marks_task() {
    let orch = MockOrch::with_snapshot(json!({
        "request_id": "req-c-1",
        "roles": [
            {"role": "DataEngineer", "status": "working", "message_id": "m-active"},
            {"role": "Reviewer", "status": "done", "message_id": "m-done"},
        ],
        "counts": {"assignments": 2, "replies": 1},
        "done_roles": ["Reviewer"],
        "complete": false,
        "replies": [{"role": "Reviewer", "body": "검토 통과"}],
    }));
    let mut h = harness_with(orch, MockLlm::with_reply("x"), |_| {});
    h.message("/dispatch 취소될 작업").await;

    let out = joined(&h.message("/cancel req-c-1").await);
    assert!(out.contains("cancel: targets=1 canceled=1 failed=0 skipped=1"));
    assert_eq!(*h.orch.fail_calls.lock().unwrap(), vec!["m-active"]);

    let state = reload(&h);
    let task = state.project("default").unwrap().task("req-c-1").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.canceled);
    assert_eq!(task.stages.close, StageStatus::Failed);
    assert_eq!(task.canceled_by.as_deref(), Some(&format!("telegram:{}", CHAT)[..]));
}

#[tokio::test]
async fn pick_selects_task_by_monitor_index() {
    let mut h = harness(|_| {});
    h.message("/dispatch 선택할 작업").await;
    h.message("/monitor").await;
    let out = joined(&h.message("/pick 1").await);
    assert!(out.contains("selected task updated"));
    assert!(out.contains("request_id: req-mock-1"));
    let state = reload(&h);
    assert_eq!(state.selected_task_ref(CHAT, "default"), "req-mock-1");
}

#[tokio::test]
async fn check_and_task_follow_selected_ref() {
    let mut h = harness(|_| {});
    h.message("/dispatch 점검할 작업").await;
    let out = joined(&h.message("/check").await);
    assert!(out.contains("3단계 진행확인"));
    assert!(out.contains("request_id: req-mock-1"));
    let out = joined(&h.message("/task").await);
    assert!(out.contains("lifecycle:"));
    assert!(out.contains("- close: done"));
}

#[tokio::test]
async fn task_resolves_by_alias_and_index() {
    let mut h = harness(|_| {});
    h.message("/dispatch 별칭 확인 작업").await;
    let out = joined(&h.message("/task T-001").await);
    assert!(out.contains("request_id: req-mock-1"));
    let out = joined(&h.message("/task 1").await);
    assert!(out.contains("request_id: req-mock-1"));
}

#[tokio::test]
async fn default_mode_routes_plain_text_to_dispatch() {
    let mut h = harness(|_| {});
    h.message("/mode on").await;
    let out = joined(&h.message("평문 라우팅 테스트").await);
    assert_eq!(out, "통합 응답");
    // default mode is sticky
    let out = joined(&h.message("두번째 평문").await);
    assert_eq!(out, "통합 응답");
}

#[tokio::test]
async fn pending_mode_is_one_shot() {
    let mut h = harness(|_| {});
    h.message("/direct").await; // one-shot direct
    let out = joined(&h.message("질문 하나").await);
    assert_eq!(out, "통합 응답", "direct path answers via the LLM");
    let out = joined(&h.message("다음 평문").await);
    assert!(out.contains("슬래시 명령만 지원합니다"), "pending consumed: {}", out);
}

#[tokio::test]
async fn kpi_counts_dispatch_events() {
    let mut h = harness(|_| {});
    h.message("/dispatch 지표에 잡힐 작업").await;
    let out = joined(&h.message("/kpi 24").await);
    assert!(out.contains("window_hours: 24"));
    assert!(out.contains("completion: dispatch=1"));
}
