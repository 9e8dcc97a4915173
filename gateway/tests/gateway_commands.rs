//! Command regression suite over the simulation path: management, ACL,
//! monitor/KPI, slash-only routing and the error-code surface.

mod common;

use common::{harness, CHAT};
use gateway::store::load_manager_state;

fn joined(replies: &[String]) -> String {
    replies.join("\n---\n")
}

#[tokio::test]
async fn help_mentions_quick_mode() {
    let mut h = harness(|_| {});
    let out = h.message("/help").await;
    assert!(joined(&out).contains("Quick mode"));
}

#[tokio::test]
async fn whoami_reports_identity() {
    let mut h = harness(|_| {});
    let out = joined(&h.message("/whoami").await);
    assert!(out.contains(&format!("chat_id: {}", CHAT)));
    assert!(out.contains("is_owner: no"));
}

#[tokio::test]
async fn whoami_owner_flag() {
    let mut h = harness(|cfg| {
        cfg.acl.owner_chat_id = CHAT.to_string();
    });
    let out = joined(&h.message("/whoami").await);
    assert!(out.contains("is_owner: yes"));
}

#[tokio::test]
async fn mode_status_and_updates() {
    let mut h = harness(|_| {});
    assert!(joined(&h.message("/mode").await).contains("routing mode"));
    assert!(joined(&h.message("/mode on").await).contains("default_mode: dispatch"));
    assert!(joined(&h.message("/on").await).contains("default_mode: dispatch"));
    assert!(joined(&h.message("/off").await).contains("default_mode: off"));
}

#[tokio::test]
async fn mode_off_is_idempotent() {
    let mut h = harness(|_| {});
    h.message("/mode on").await;
    let first = joined(&h.message("/off").await);
    assert!(first.contains("- changed: yes"));
    let second = joined(&h.message("/off").await);
    assert!(second.contains("- changed: no"));
    let state = load_manager_state(&h.gw.cfg.manager_state_file, h.dir.path(), &h.gw.cfg.team_dir);
    assert!(state.chat_sessions.is_empty(), "mode off twice leaves no session row");
}

#[tokio::test]
async fn mode_off_clears_pending_and_confirm() {
    let mut h = harness(|_| {});
    h.message("/mode on").await;
    h.message("rm -rf /tmp/demo").await; // arms the confirmation
    let out = joined(&h.message("/off").await);
    assert!(out.contains("confirm_request_cleared: yes"));

    h.message("/dispatch").await; // pending one-shot
    let out = joined(&h.message("/off").await);
    assert!(out.contains("one_shot_pending_cleared: yes"));
}

#[tokio::test]
async fn lockme_claims_gateway() {
    let mut h = harness(|_| {});
    let out = joined(&h.message("/lockme").await);
    assert!(out.contains("cleared_admin_readonly: yes"));
    assert_eq!(h.gw.cfg.acl.owner_chat_id, CHAT);
    let env = std::fs::read_to_string(h.gw.cfg.team_dir.join("telegram.env")).unwrap();
    assert!(env.contains(&format!("TELEGRAM_ALLOW_CHAT_IDS={}", CHAT)));
    assert!(env.contains(&format!("TELEGRAM_OWNER_CHAT_ID={}", CHAT)));
}

#[tokio::test]
async fn acl_lists_sets_and_alias() {
    let mut h = harness(|_| {});
    let out = joined(&h.message("/acl").await);
    assert!(out.contains("access control list"));
    assert!(out.contains("my_alias: 1"));
}

#[tokio::test]
async fn grant_and_revoke_round_trip() {
    let mut h = harness(|_| {});
    let out = joined(&h.message("/grant readonly 2000002").await);
    assert!(out.contains("action: grant"));
    assert!(out.contains("role_now: readonly"));
    assert!(h.gw.cfg.acl.readonly.contains("2000002"));

    let out = joined(&h.message("/revoke all 2000002").await);
    assert!(out.contains("action: revoke"));
    assert!(!h.gw.cfg.acl.readonly.contains("2000002"));
}

#[tokio::test]
async fn grant_moves_target_out_of_readonly() {
    let mut h = harness(|_| {});
    h.message("/grant readonly 2000002").await;
    h.message("/grant admin 2000002").await;
    assert!(h.gw.cfg.acl.admin.contains("2000002"));
    assert!(!h.gw.cfg.acl.readonly.contains("2000002"), "readonly must stay disjoint");
}

#[tokio::test]
async fn self_revoke_guard_blocks_admin_loss() {
    let mut h = harness(|_| {});
    let out = joined(&h.message(&format!("/revoke allow {}", CHAT)).await);
    assert!(out.contains("blocked: self-revoke"));
    assert!(h.gw.cfg.acl.allow.contains(CHAT));
}

#[tokio::test]
async fn owner_only_gate_denies_non_owner() {
    let mut h = harness(|cfg| {
        cfg.acl.allow.insert("9999999".to_string());
        cfg.acl.owner_chat_id = "9999999".to_string();
    });
    let out = joined(&h.message("/lockme").await);
    assert!(out.contains("owner-only"));
    let out = joined(&h.message("/grant admin 2000002").await);
    assert!(out.contains("owner-only"));
}

#[tokio::test]
async fn readonly_role_is_restricted() {
    let mut h = harness(|cfg| {
        cfg.acl.allow.clear();
        cfg.acl.readonly.insert(CHAT.to_string());
    });
    // allowed: status-ish commands
    let out = joined(&h.message("/monitor").await);
    assert!(out.contains("orch: default"));
    // denied: run
    let out = joined(&h.message("/dispatch do something").await);
    assert!(out.contains("permission denied: readonly chat."));
}

#[tokio::test]
async fn unknown_role_gets_minimal_surface() {
    let mut h = harness(|cfg| {
        cfg.acl.allow.clear();
        cfg.acl.allow.insert("7777777".to_string());
    });
    // CHAT is not in the ACL anymore but reaches the handler in this test;
    // every command outside the bootstrap set is denied.
    let out = joined(&h.message("/monitor").await);
    assert!(out.contains("permission denied: unauthorized chat."));
    let out = joined(&h.message("/help").await);
    assert!(out.contains("Quick mode"));
}

#[tokio::test]
async fn monitor_lists_orch_header() {
    let mut h = harness(|_| {});
    assert!(joined(&h.message("/monitor 2").await).contains("orch: default"));
}

#[tokio::test]
async fn quick_korean_monitor_resolves_under_slash_only() {
    let mut h = harness(|_| {});
    assert!(joined(&h.message("모니터 2").await).contains("orch: default"));
}

#[tokio::test]
async fn kpi_reports_window() {
    let mut h = harness(|_| {});
    assert!(joined(&h.message("/kpi 24").await).contains("window_hours:"));
}

#[tokio::test]
async fn pick_without_ref_shows_usage() {
    let mut h = harness(|_| {});
    assert!(joined(&h.message("/pick").await).contains("usage: /pick"));
}

#[tokio::test]
async fn plain_text_rejected_under_slash_only() {
    let mut h = harness(|_| {});
    let out = joined(&h.message("안녕").await);
    assert!(out.contains("슬래시 명령만 지원합니다"));
}

#[tokio::test]
async fn dry_run_dispatch_preview() {
    let mut h = harness(|cfg| {
        cfg.dry_run = true;
    });
    let out = joined(&h.message("/dispatch 샘플 작업 실행").await);
    assert!(out.contains("[DRY-RUN] orch="));
    assert!(out.contains("mode: dispatch"));
}

#[tokio::test]
async fn default_mode_plain_text_dry_run_preview() {
    let mut h = harness(|cfg| {
        cfg.dry_run = true;
    });
    let mut state = gateway::store::default_manager_state(h.dir.path(), &h.gw.cfg.team_dir);
    state.set_default_mode(CHAT, gateway::store::RunMode::Dispatch);
    gateway::store::save_manager_state(&h.gw.cfg.manager_state_file, &mut state).unwrap();

    let out = joined(&h.message("평문 라우팅 테스트").await);
    assert!(out.contains("[DRY-RUN] orch="), "default-mode plain text previews: {}", out);
}

#[tokio::test]
async fn stored_confirmation_redeems_in_dry_run() {
    let mut h = harness(|cfg| {
        cfg.dry_run = true;
        cfg.confirm_ttl_sec = 86400;
    });
    let mut state = gateway::store::default_manager_state(h.dir.path(), &h.gw.cfg.team_dir);
    state.set_confirm_action(
        CHAT,
        gateway::store::RunMode::Dispatch,
        "rm -rf /tmp/demo",
        "destructive_delete",
        "",
    );
    gateway::store::save_manager_state(&h.gw.cfg.manager_state_file, &mut state).unwrap();

    let out = joined(&h.message("/ok").await);
    assert!(out.contains("[DRY-RUN] orch="), "redeemed /ok previews the stored run: {}", out);
}

#[tokio::test]
async fn error_cases_surface_e_command() {
    let cases = [
        "aoe run --priority X hello",
        "aoe orch use no_such_project",
        "aoe retry",
        "aoe replan",
        "aoe mode weird",
        "aoe on now please",
        "aoe ok now",
        "aoe grant admin abc",
        "aoe revoke nope 123456",
    ];
    for text in cases {
        let mut h = harness(|cfg| {
            cfg.slash_only = false;
        });
        let out = joined(&h.message(text).await);
        assert!(
            out.contains("error_code: E_COMMAND"),
            "expected E_COMMAND for {:?}, got: {}",
            text,
            out
        );
    }
}

#[tokio::test]
async fn orch_status_includes_subprocess_output() {
    let mut h = harness(|_| {});
    let out = joined(&h.message("aoe orch status").await);
    // slash-only on: CLI form is ignored, so use the slash alias instead
    assert!(out.contains("슬래시 명령만 지원합니다") || out.is_empty());

    let mut h = harness(|cfg| {
        cfg.slash_only = false;
    });
    let out = joined(&h.message("aoe orch status").await);
    assert!(out.contains("orch: default"));
    assert!(out.contains("mock orchestrator status"));
}

#[tokio::test]
async fn orch_list_and_use() {
    let mut h = harness(|cfg| {
        cfg.slash_only = false;
    });
    let out = joined(&h.message("aoe orch list").await);
    assert!(out.contains("active: default"));
    let out = joined(&h.message("aoe orch use default").await);
    assert!(out.contains("active orch changed: default"));
}

#[tokio::test]
async fn add_role_dry_run_preview() {
    let mut h = harness(|cfg| {
        cfg.slash_only = false;
        cfg.dry_run = true;
    });
    let out = joined(&h.message("aoe add-role QA --no-spawn").await);
    assert!(out.contains("[DRY-RUN] add-role"));
    assert!(out.contains("- role: QA"));
}

#[tokio::test]
async fn unknown_slash_command_gets_help() {
    let mut h = harness(|_| {});
    let out = joined(&h.message("/frobnicate").await);
    assert!(out.contains("unknown command: /frobnicate"));
    assert!(out.contains("Quick mode"));
}

#[tokio::test]
async fn every_reply_logs_exactly_one_send_event() {
    let mut h = harness(|_| {});
    h.message("/help").await;
    let log = std::fs::read_to_string(
        h.gw.cfg.team_dir.join("logs").join("gateway_events.jsonl"),
    )
    .unwrap();
    let sends = log.lines().filter(|l| l.contains("\"send_message\"")).count();
    assert_eq!(sends, 1);
    assert!(log.contains("\"incoming_message\""));
    assert!(log.contains("\"command_resolved\""));
}
