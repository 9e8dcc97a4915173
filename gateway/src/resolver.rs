//! Command resolution: slash aliases first, then quick/CLI fallbacks, then
//! pending/default-mode plain-text routing, producing a typed
//! [`ResolvedCommand`].

use std::path::Path;

use crate::acl::{parse_acl_command_args, parse_acl_revoke_args};
use crate::error::GatewayError;
use crate::parse::{
    normalize_mode_token, parse_cli_message, parse_command, parse_quick_message, ParsedMessage,
};
use crate::store::{save_manager_state, ManagerState, RunMode};

/// Every command the gateway routes, tagged with typed payload slots on the
/// surrounding [`ResolvedCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cmd {
    /// Nothing resolved; plain text under slash-only or run-default routing.
    None,
    Start,
    Help,
    OrchHelp,
    Whoami,
    Lockme,
    Acl,
    Grant,
    Revoke,
    Mode,
    QuickDispatch,
    QuickDirect,
    CancelPending,
    ConfirmRun,
    Run,
    OrchRun,
    Request,
    AddRole,
    OrchList,
    OrchUse,
    OrchAdd,
    Status,
    OrchStatus,
    OrchCheck,
    OrchTask,
    OrchPick,
    OrchCancel,
    OrchRetry,
    OrchReplan,
    OrchMonitor,
    OrchKpi,
    Unknown(String),
}

impl Cmd {
    /// Canonical key used for auth tables and event rows.
    pub fn key(&self) -> String {
        match self {
            Cmd::None => String::new(),
            Cmd::Start => "start".into(),
            Cmd::Help => "help".into(),
            Cmd::OrchHelp => "orch-help".into(),
            Cmd::Whoami => "whoami".into(),
            Cmd::Lockme => "lockme".into(),
            Cmd::Acl => "acl".into(),
            Cmd::Grant => "grant".into(),
            Cmd::Revoke => "revoke".into(),
            Cmd::Mode => "mode".into(),
            Cmd::QuickDispatch => "quick-dispatch".into(),
            Cmd::QuickDirect => "quick-direct".into(),
            Cmd::CancelPending => "cancel-pending".into(),
            Cmd::ConfirmRun => "confirm-run".into(),
            Cmd::Run => "run".into(),
            Cmd::OrchRun => "orch-run".into(),
            Cmd::Request => "request".into(),
            Cmd::AddRole => "add-role".into(),
            Cmd::OrchList => "orch-list".into(),
            Cmd::OrchUse => "orch-use".into(),
            Cmd::OrchAdd => "orch-add".into(),
            Cmd::Status => "status".into(),
            Cmd::OrchStatus => "orch-status".into(),
            Cmd::OrchCheck => "orch-check".into(),
            Cmd::OrchTask => "orch-task".into(),
            Cmd::OrchPick => "orch-pick".into(),
            Cmd::OrchCancel => "orch-cancel".into(),
            Cmd::OrchRetry => "orch-retry".into(),
            Cmd::OrchReplan => "orch-replan".into(),
            Cmd::OrchMonitor => "orch-monitor".into(),
            Cmd::OrchKpi => "orch-kpi".into(),
            Cmd::Unknown(s) => s.clone(),
        }
    }

    fn from_key(key: &str) -> Cmd {
        match key {
            "" => Cmd::None,
            "start" => Cmd::Start,
            "help" => Cmd::Help,
            "orch-help" => Cmd::OrchHelp,
            "whoami" => Cmd::Whoami,
            "lockme" => Cmd::Lockme,
            "acl" => Cmd::Acl,
            "grant" => Cmd::Grant,
            "revoke" => Cmd::Revoke,
            "mode" => Cmd::Mode,
            "quick-dispatch" => Cmd::QuickDispatch,
            "quick-direct" => Cmd::QuickDirect,
            "cancel-pending" => Cmd::CancelPending,
            "confirm-run" => Cmd::ConfirmRun,
            "run" => Cmd::Run,
            "orch-run" => Cmd::OrchRun,
            "request" => Cmd::Request,
            "add-role" => Cmd::AddRole,
            "orch-list" => Cmd::OrchList,
            "orch-use" => Cmd::OrchUse,
            "orch-add" => Cmd::OrchAdd,
            "status" => Cmd::Status,
            "orch-status" => Cmd::OrchStatus,
            "orch-check" => Cmd::OrchCheck,
            "orch-task" => Cmd::OrchTask,
            "orch-pick" => Cmd::OrchPick,
            "orch-cancel" => Cmd::OrchCancel,
            "orch-retry" => Cmd::OrchRetry,
            "orch-replan" => Cmd::OrchReplan,
            "orch-monitor" => Cmd::OrchMonitor,
            "orch-kpi" => Cmd::OrchKpi,
            other => Cmd::Unknown(other.to_string()),
        }
    }
}

/// Requested `/mode` setting, including the explicit invalid marker used by
/// the quick parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSetting {
    Status,
    Dispatch,
    Direct,
    Off,
    Invalid,
}

impl ModeSetting {
    pub fn from_token(token: &str) -> ModeSetting {
        match token {
            "status" => ModeSetting::Status,
            "dispatch" => ModeSetting::Dispatch,
            "direct" => ModeSetting::Direct,
            "off" => ModeSetting::Off,
            _ => ModeSetting::Invalid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    pub cmd: Cmd,
    pub rest: String,
    pub came_from_slash: bool,

    pub run_prompt: String,
    pub run_roles_override: Option<String>,
    pub run_priority_override: Option<String>,
    pub run_timeout_override: Option<i64>,
    pub run_no_wait_override: Option<bool>,
    pub run_force_mode: Option<RunMode>,

    pub add_role_name: Option<String>,
    pub add_role_provider: Option<String>,
    pub add_role_launch: Option<String>,
    pub add_role_spawn: bool,

    pub orch_target: Option<String>,
    pub orch_add_name: Option<String>,
    pub orch_add_path: Option<String>,
    pub orch_add_overview: Option<String>,
    pub orch_add_init: bool,
    pub orch_add_spawn: bool,
    pub orch_add_set_active: bool,
    pub orch_check_request_id: Option<String>,
    pub orch_task_request_id: Option<String>,
    pub orch_pick_request_id: Option<String>,
    pub orch_cancel_request_id: Option<String>,
    pub orch_retry_request_id: Option<String>,
    pub orch_replan_request_id: Option<String>,
    pub orch_monitor_limit: Option<i64>,
    pub orch_kpi_hours: Option<i64>,

    pub mode_setting: Option<ModeSetting>,
    pub acl_grant_scope: Option<String>,
    pub acl_grant_chat_id: Option<String>,
    pub acl_revoke_scope: Option<String>,
    pub acl_revoke_chat_id: Option<String>,

    /// Where an auto-synthesized run came from: `pending`, `default`, or
    /// `confirmed`. Empty for explicit commands.
    pub run_auto_source: String,
}

impl Default for ResolvedCommand {
    fn default() -> Self {
        ResolvedCommand {
            cmd: Cmd::None,
            rest: String::new(),
            came_from_slash: false,
            run_prompt: String::new(),
            run_roles_override: None,
            run_priority_override: None,
            run_timeout_override: None,
            run_no_wait_override: None,
            run_force_mode: None,
            add_role_name: None,
            add_role_provider: None,
            add_role_launch: None,
            add_role_spawn: true,
            orch_target: None,
            orch_add_name: None,
            orch_add_path: None,
            orch_add_overview: None,
            orch_add_init: true,
            orch_add_spawn: true,
            orch_add_set_active: true,
            orch_check_request_id: None,
            orch_task_request_id: None,
            orch_pick_request_id: None,
            orch_cancel_request_id: None,
            orch_retry_request_id: None,
            orch_replan_request_id: None,
            orch_monitor_limit: None,
            orch_kpi_hours: None,
            mode_setting: None,
            acl_grant_scope: None,
            acl_grant_chat_id: None,
            acl_revoke_scope: None,
            acl_revoke_chat_id: None,
            run_auto_source: String::new(),
        }
    }
}

/// Commands admitted during deny-by-default bootstrap (empty ACL).
pub fn is_bootstrap_allowed_command(text: &str) -> bool {
    let (cmd, _) = parse_command(text);
    matches!(cmd.as_str(), "start" | "help" | "id" | "whoami" | "lockme" | "onlyme")
}

fn apply_parsed(out: &mut ResolvedCommand, parsed: &ParsedMessage) {
    out.cmd = Cmd::from_key(parsed.cmd.trim());
    match &out.cmd {
        Cmd::Request => {
            out.rest = parsed.request_id.clone().unwrap_or_default().trim().to_string();
        }
        Cmd::Run | Cmd::OrchRun => {
            out.run_prompt = parsed.prompt.clone().unwrap_or_default().trim().to_string();
            out.run_roles_override = parsed.roles.clone();
            out.run_priority_override = parsed.priority.clone();
            out.run_timeout_override = parsed.timeout_sec;
            out.run_no_wait_override = Some(parsed.no_wait);
            out.run_force_mode = parsed.force_mode.as_deref().and_then(RunMode::parse);
            out.orch_target = parsed.orch.clone();
        }
        Cmd::AddRole => {
            out.add_role_name = parsed.role.clone().map(|r| r.trim().to_string());
            out.add_role_provider = parsed.provider.clone();
            out.add_role_launch = parsed.launch.clone();
            out.add_role_spawn = parsed.spawn;
        }
        Cmd::OrchUse | Cmd::OrchStatus => {
            out.orch_target = parsed.orch.clone();
        }
        Cmd::OrchAdd => {
            out.orch_add_name = parsed.orch.clone().map(|s| s.trim().to_string());
            out.orch_add_path = parsed.path.clone().map(|s| s.trim().to_string());
            out.orch_add_overview = parsed.overview.clone();
            out.orch_add_init = parsed.init;
            out.orch_add_spawn = parsed.spawn;
            out.orch_add_set_active = parsed.set_active;
        }
        Cmd::OrchCheck => {
            out.orch_target = parsed.orch.clone();
            out.orch_check_request_id = parsed.request_id.clone();
        }
        Cmd::OrchTask => {
            out.orch_target = parsed.orch.clone();
            out.orch_task_request_id = parsed.request_id.clone();
        }
        Cmd::OrchPick => {
            out.orch_target = parsed.orch.clone();
            out.orch_pick_request_id = parsed.request_id.clone();
        }
        Cmd::OrchCancel => {
            out.orch_target = parsed.orch.clone();
            out.orch_cancel_request_id = parsed.request_id.clone();
        }
        Cmd::OrchRetry => {
            out.orch_target = parsed.orch.clone();
            out.orch_retry_request_id = parsed.request_id.clone();
        }
        Cmd::OrchReplan => {
            out.orch_target = parsed.orch.clone();
            out.orch_replan_request_id = parsed.request_id.clone();
        }
        Cmd::OrchMonitor => {
            out.orch_target = parsed.orch.clone();
            out.orch_monitor_limit = parsed.limit;
        }
        Cmd::OrchKpi => {
            out.orch_target = parsed.orch.clone();
            out.orch_kpi_hours = parsed.hours;
        }
        Cmd::Mode => {
            let token = parsed.mode.clone().unwrap_or_else(|| "status".to_string());
            out.mode_setting = Some(ModeSetting::from_token(token.trim()));
        }
        Cmd::Grant => {
            out.acl_grant_scope = parsed.scope.clone().filter(|s| !s.trim().is_empty());
            out.acl_grant_chat_id = parsed.chat_id.clone().filter(|s| !s.trim().is_empty());
        }
        Cmd::Revoke => {
            out.acl_revoke_scope = parsed.scope.clone().filter(|s| !s.trim().is_empty());
            out.acl_revoke_chat_id = parsed.chat_id.clone().filter(|s| !s.trim().is_empty());
        }
        _ => {}
    }
}

fn resolve_slash(out: &mut ResolvedCommand, head: &str) -> Result<(), GatewayError> {
    let slash_rest = out.rest.trim().to_string();
    match head {
        "menu" => out.cmd = Cmd::Help,
        "ok" | "confirm" => {
            if !slash_rest.is_empty() {
                return Err(GatewayError::usage("usage: /ok"));
            }
            out.cmd = Cmd::ConfirmRun;
        }
        "cancel" => {
            if !slash_rest.is_empty() {
                out.cmd = Cmd::OrchCancel;
                out.orch_cancel_request_id = Some(slash_rest);
            } else {
                out.cmd = Cmd::CancelPending;
            }
        }
        "id" | "whoami" => out.cmd = Cmd::Whoami,
        "mode" | "inbox" | "on" | "off" => {
            let mode_arg = if matches!(head, "inbox" | "on") && slash_rest.is_empty() {
                "dispatch".to_string()
            } else if head == "off" && slash_rest.is_empty() {
                "off".to_string()
            } else {
                slash_rest
            };
            let normalized = normalize_mode_token(&mode_arg);
            if normalized.is_empty() {
                return Err(GatewayError::usage("usage: /mode [on|off|direct|dispatch]"));
            }
            out.cmd = Cmd::Mode;
            out.mode_setting = Some(ModeSetting::from_token(normalized));
        }
        "lockme" | "onlyme" => out.cmd = Cmd::Lockme,
        "acl" | "auth" | "permission" | "permissions" => out.cmd = Cmd::Acl,
        "grant" => {
            out.cmd = Cmd::Grant;
            let (scope, chat_ref) =
                parse_acl_command_args(&slash_rest, "usage: /grant <allow|admin|readonly> <chat_id|alias>")?;
            out.acl_grant_scope = Some(scope);
            out.acl_grant_chat_id = Some(chat_ref);
        }
        "revoke" => {
            out.cmd = Cmd::Revoke;
            let (scope, chat_ref) =
                parse_acl_revoke_args(&slash_rest, "usage: /revoke <allow|admin|readonly|all> <chat_id|alias>")?;
            out.acl_revoke_scope = Some(scope);
            out.acl_revoke_chat_id = Some(chat_ref);
        }
        "retry" => {
            out.cmd = Cmd::OrchRetry;
            out.orch_retry_request_id = if slash_rest.is_empty() { None } else { Some(slash_rest) };
        }
        "replan" => {
            out.cmd = Cmd::OrchReplan;
            out.orch_replan_request_id = if slash_rest.is_empty() { None } else { Some(slash_rest) };
        }
        "monitor" | "tasks" | "board" => {
            out.cmd = Cmd::OrchMonitor;
            if let Some(token) = slash_rest.split_whitespace().next() {
                if token.chars().all(|c| c.is_ascii_digit()) && !token.is_empty() {
                    out.orch_monitor_limit = token.parse::<i64>().ok().map(|n| n.clamp(1, 50));
                } else {
                    out.orch_target = Some(token.to_string());
                }
            }
        }
        "check" | "progress" => {
            out.cmd = Cmd::OrchCheck;
            out.orch_check_request_id = if slash_rest.is_empty() { None } else { Some(slash_rest) };
        }
        "kpi" | "metrics" => {
            out.cmd = Cmd::OrchKpi;
            if let Some(token) = slash_rest.split_whitespace().next() {
                if token.chars().all(|c| c.is_ascii_digit()) && !token.is_empty() {
                    out.orch_kpi_hours = token.parse::<i64>().ok().map(|n| n.clamp(1, 168));
                } else {
                    out.orch_target = Some(token.to_string());
                }
            }
        }
        "task" | "lifecycle" => {
            out.cmd = Cmd::OrchTask;
            out.orch_task_request_id = if slash_rest.is_empty() { None } else { Some(slash_rest) };
        }
        "pick" | "select" => {
            out.cmd = Cmd::OrchPick;
            out.orch_pick_request_id = if slash_rest.is_empty() { None } else { Some(slash_rest) };
        }
        "dispatch" | "team" => {
            if slash_rest.is_empty() {
                out.cmd = Cmd::QuickDispatch;
            } else {
                out.cmd = Cmd::Run;
                out.run_force_mode = Some(RunMode::Dispatch);
                out.run_prompt = slash_rest;
            }
        }
        "direct" | "ask" | "question" => {
            if slash_rest.is_empty() {
                out.cmd = Cmd::QuickDirect;
            } else {
                out.cmd = Cmd::Run;
                out.run_force_mode = Some(RunMode::Direct);
                out.run_prompt = slash_rest;
            }
        }
        other => out.cmd = Cmd::from_key(other),
    }
    Ok(())
}

/// Turns an inbound message into a typed command. Ordering: slash first;
/// quick then CLI forms only when slash-only is off; pending/default
/// plain-text routing last; a slash-only safe subset of quick commands
/// still resolves under slash-only.
pub fn resolve_message_command(
    text: &str,
    slash_only: bool,
    state: &mut ManagerState,
    chat_id: &str,
    dry_run: bool,
    manager_state_file: &Path,
) -> Result<ResolvedCommand, GatewayError> {
    let mut out = ResolvedCommand::default();
    let (head, rest) = parse_command(text);
    out.rest = rest;
    out.came_from_slash = !head.is_empty();

    if !head.is_empty() {
        resolve_slash(&mut out, &head)?;
    }

    if out.cmd == Cmd::None && !slash_only {
        if let Some(quick) = parse_quick_message(text) {
            apply_parsed(&mut out, &quick);
        }
    }

    if out.cmd == Cmd::None && !slash_only {
        if let Some(cli) = parse_cli_message(text)? {
            apply_parsed(&mut out, &cli);
        }
    }

    if out.cmd == Cmd::None {
        let pending_prompt = text.trim().to_string();
        if let Some(pending_mode) = state.pending_mode(chat_id) {
            if !pending_prompt.is_empty() {
                out.cmd = Cmd::Run;
                out.run_prompt = pending_prompt.clone();
                out.run_force_mode = Some(pending_mode);
                out.run_auto_source = "pending".to_string();
                if state.clear_pending_mode(chat_id) && !dry_run {
                    if let Err(e) = save_manager_state(manager_state_file, state) {
                        tracing::warn!(error = %e, "state save after pending-mode consume failed");
                    }
                }
            }
        } else if !pending_prompt.is_empty() {
            if let Some(default_mode) = state.default_mode(chat_id) {
                out.cmd = Cmd::Run;
                out.run_prompt = pending_prompt;
                out.run_force_mode = Some(default_mode);
                out.run_auto_source = "default".to_string();
            }
        }
    }

    if out.cmd == Cmd::None && slash_only {
        if let Some(natural) = parse_quick_message(text) {
            const SAFE_CMDS: &[&str] = &[
                "help",
                "confirm-run",
                "mode",
                "acl",
                "status",
                "orch-kpi",
                "orch-monitor",
                "orch-check",
                "orch-task",
                "orch-pick",
                "orch-cancel",
                "orch-retry",
                "orch-replan",
                "cancel-pending",
            ];
            if SAFE_CMDS.contains(&natural.cmd.as_str()) {
                apply_parsed(&mut out, &natural);
                // orch targets are not honored on the slash-only safe path
                out.orch_target = None;
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::default_manager_state;
    use std::path::PathBuf;

    struct Fixture {
        state: ManagerState,
        state_file: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let state = default_manager_state(dir.path(), &dir.path().join(".aoe-team"));
        let state_file = dir.path().join("orch_manager_state.json");
        Fixture {
            state,
            state_file,
            _dir: dir,
        }
    }

    fn resolve(f: &mut Fixture, text: &str, slash_only: bool) -> ResolvedCommand {
        resolve_message_command(text, slash_only, &mut f.state, "100000", false, &f.state_file).unwrap()
    }

    #[test]
    fn slash_dispatch_with_rest_is_forced_run() {
        let mut f = fixture();
        let out = resolve(&mut f, "/dispatch 샘플 작업 실행", true);
        assert_eq!(out.cmd, Cmd::Run);
        assert_eq!(out.run_force_mode, Some(RunMode::Dispatch));
        assert_eq!(out.run_prompt, "샘플 작업 실행");
        assert!(out.came_from_slash);
    }

    #[test]
    fn slash_dispatch_without_rest_is_quick_mode() {
        let mut f = fixture();
        assert_eq!(resolve(&mut f, "/dispatch", true).cmd, Cmd::QuickDispatch);
        assert_eq!(resolve(&mut f, "/direct", true).cmd, Cmd::QuickDirect);
    }

    #[test]
    fn slash_ok_with_rest_is_usage_error() {
        let mut f = fixture();
        let err =
            resolve_message_command("/ok now", true, &mut f.state, "100000", false, &f.state_file).unwrap_err();
        assert!(err.to_string().contains("usage: /ok"));
        assert_eq!(resolve(&mut f, "/ok", true).cmd, Cmd::ConfirmRun);
    }

    #[test]
    fn slash_cancel_routes_by_rest() {
        let mut f = fixture();
        assert_eq!(resolve(&mut f, "/cancel", true).cmd, Cmd::CancelPending);
        let out = resolve(&mut f, "/cancel T-001", true);
        assert_eq!(out.cmd, Cmd::OrchCancel);
        assert_eq!(out.orch_cancel_request_id.as_deref(), Some("T-001"));
    }

    #[test]
    fn slash_on_off_map_to_mode() {
        let mut f = fixture();
        let out = resolve(&mut f, "/on", true);
        assert_eq!(out.cmd, Cmd::Mode);
        assert_eq!(out.mode_setting, Some(ModeSetting::Dispatch));
        let out = resolve(&mut f, "/off", true);
        assert_eq!(out.mode_setting, Some(ModeSetting::Off));
        let out = resolve(&mut f, "/mode", true);
        assert_eq!(out.mode_setting, Some(ModeSetting::Status));
    }

    #[test]
    fn slash_monitor_numeric_rest_is_limit() {
        let mut f = fixture();
        let out = resolve(&mut f, "/monitor 2", true);
        assert_eq!(out.cmd, Cmd::OrchMonitor);
        assert_eq!(out.orch_monitor_limit, Some(2));
        let out = resolve(&mut f, "/monitor demo", true);
        assert_eq!(out.orch_target.as_deref(), Some("demo"));
    }

    #[test]
    fn unknown_slash_command_is_unknown() {
        let mut f = fixture();
        let out = resolve(&mut f, "/frobnicate", true);
        assert_eq!(out.cmd, Cmd::Unknown("frobnicate".into()));
    }

    #[test]
    fn plain_text_slash_only_resolves_nothing() {
        let mut f = fixture();
        let out = resolve(&mut f, "안녕하세요", true);
        assert_eq!(out.cmd, Cmd::None);
    }

    #[test]
    fn quick_parser_runs_when_slash_only_off() {
        let mut f = fixture();
        let out = resolve(&mut f, "모니터 2", false);
        assert_eq!(out.cmd, Cmd::OrchMonitor);
        assert_eq!(out.orch_monitor_limit, Some(2));
    }

    #[test]
    fn cli_parser_runs_after_quick() {
        let mut f = fixture();
        let out = resolve(&mut f, "aoe run --dispatch do it", false);
        assert_eq!(out.cmd, Cmd::Run);
        assert_eq!(out.run_force_mode, Some(RunMode::Dispatch));
        assert_eq!(out.run_prompt, "do it");
    }

    #[test]
    fn safe_quick_commands_resolve_under_slash_only() {
        let mut f = fixture();
        let out = resolve(&mut f, "모니터 2", true);
        assert_eq!(out.cmd, Cmd::OrchMonitor);
        // but run-producing quick forms do not
        let out = resolve(&mut f, "팀작업: 뭔가 해줘", true);
        assert_eq!(out.cmd, Cmd::None);
    }

    #[test]
    fn pending_mode_consumed_into_run() {
        let mut f = fixture();
        f.state.set_pending_mode("100000", RunMode::Direct);
        let out = resolve(&mut f, "평문 질문입니다", true);
        assert_eq!(out.cmd, Cmd::Run);
        assert_eq!(out.run_force_mode, Some(RunMode::Direct));
        assert_eq!(out.run_auto_source, "pending");
        assert!(f.state.pending_mode("100000").is_none(), "pending is one-shot");
        assert!(f.state_file.exists(), "consumption persists the state");
    }

    #[test]
    fn default_mode_routes_without_clearing() {
        let mut f = fixture();
        f.state.set_default_mode("100000", RunMode::Dispatch);
        let out = resolve(&mut f, "평문 라우팅 테스트", true);
        assert_eq!(out.cmd, Cmd::Run);
        assert_eq!(out.run_force_mode, Some(RunMode::Dispatch));
        assert_eq!(out.run_auto_source, "default");
        assert_eq!(f.state.default_mode("100000"), Some(RunMode::Dispatch));
    }

    #[test]
    fn explicit_command_wins_over_default_mode() {
        let mut f = fixture();
        f.state.set_default_mode("100000", RunMode::Dispatch);
        let out = resolve(&mut f, "aoe mode off", false);
        assert_eq!(out.cmd, Cmd::Mode);
        assert_eq!(out.mode_setting, Some(ModeSetting::Off));
    }

    #[test]
    fn bootstrap_allowlist_table() {
        assert!(is_bootstrap_allowed_command("/lockme"));
        assert!(is_bootstrap_allowed_command("/whoami extra"));
        assert!(is_bootstrap_allowed_command("/help"));
        assert!(!is_bootstrap_allowed_command("/run thing"));
        assert!(!is_bootstrap_allowed_command("plain text"));
    }

    #[test]
    fn slash_grant_parses_args() {
        let mut f = fixture();
        let out = resolve(&mut f, "/grant admin 123456789", true);
        assert_eq!(out.cmd, Cmd::Grant);
        assert_eq!(out.acl_grant_scope.as_deref(), Some("admin"));
        assert_eq!(out.acl_grant_chat_id.as_deref(), Some("123456789"));
        assert!(
            resolve_message_command("/grant bogus x", true, &mut f.state, "100000", false, &f.state_file).is_err()
        );
    }
}
