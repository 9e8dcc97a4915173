//! Management commands: routing modes, identity, ACL listing and mutation,
//! the lockme claim flow, and help.

use crate::acl::{resolve_role_from_acl_sets, ChatRole};
use crate::app::{EventFields, Gateway, Turn};
use crate::config::sync_acl_env_file;
use crate::error::{GatewayError, ERROR_INTERNAL};
use crate::render::help_text;
use crate::resolver::{Cmd, ModeSetting, ResolvedCommand};
use crate::store::{ManagerState, RunMode};

/// Handles the management command family; returns true when the command was
/// consumed.
pub async fn handle_management_command(
    gw: &mut Gateway,
    turn: &mut Turn,
    state: &mut ManagerState,
    resolved: &ResolvedCommand,
    chat_role: ChatRole,
    current_chat_alias: &str,
) -> Result<bool, GatewayError> {
    match &resolved.cmd {
        Cmd::Mode => handle_mode(gw, turn, state, resolved, chat_role).await.map(|_| true),
        Cmd::QuickDispatch => {
            state.set_pending_mode(&turn.chat_id, RunMode::Dispatch);
            gw.persist(state);
            gw.send(
                turn,
                "dispatch 모드 활성화: 다음 메시지 1개를 팀 작업으로 배정합니다.\n바로 실행: /dispatch <요청>\n취소: /cancel",
                "quick-dispatch",
                true,
            )
            .await;
            Ok(true)
        }
        Cmd::QuickDirect => {
            state.set_pending_mode(&turn.chat_id, RunMode::Direct);
            gw.persist(state);
            gw.send(
                turn,
                "direct 모드 활성화: 다음 메시지 1개를 오케스트레이터가 직접 답변합니다.\n바로 실행: /direct <질문>\n취소: /cancel",
                "quick-direct",
                true,
            )
            .await;
            Ok(true)
        }
        Cmd::CancelPending => {
            let existed = state.clear_pending_mode(&turn.chat_id);
            let cleared_confirm = state.clear_confirm_action(&turn.chat_id);
            gw.persist(state);
            let body = if existed || cleared_confirm {
                "대기 모드/확인 요청을 해제했습니다."
            } else {
                "해제할 대기 모드나 확인 요청이 없습니다."
            };
            gw.send(turn, body, "cancel-pending", true).await;
            Ok(true)
        }
        Cmd::Whoami => {
            handle_whoami(gw, turn, state, current_chat_alias).await;
            Ok(true)
        }
        Cmd::Acl => {
            handle_acl(gw, turn, current_chat_alias).await;
            Ok(true)
        }
        Cmd::Grant => handle_grant(gw, turn, resolved).await.map(|_| true),
        Cmd::Revoke => handle_revoke(gw, turn, resolved).await.map(|_| true),
        Cmd::Lockme => {
            handle_lockme(gw, turn).await;
            Ok(true)
        }
        Cmd::Start | Cmd::Help | Cmd::OrchHelp => {
            gw.send(turn, &help_text(), "help", true).await;
            Ok(true)
        }
        _ => Ok(false),
    }
}

async fn handle_mode(
    gw: &mut Gateway,
    turn: &mut Turn,
    state: &mut ManagerState,
    resolved: &ResolvedCommand,
    chat_role: ChatRole,
) -> Result<(), GatewayError> {
    let current_default = state.default_mode(&turn.chat_id);
    let current_pending = state.pending_mode(&turn.chat_id);
    let requested = resolved.mode_setting.unwrap_or(ModeSetting::Status);
    if requested == ModeSetting::Invalid {
        return Err(GatewayError::usage("usage: /mode [on|off|direct|dispatch]"));
    }

    if requested == ModeSetting::Status {
        gw.send(
            turn,
            &format!(
                "routing mode\n- default_mode: {}\n- one_shot_pending: {}\n- set: /mode on | /mode direct | /mode off\n- shortcut: /on | /off\n- tip: /mode on 후에는 평문을 바로 작업으로 보낼 수 있습니다.",
                current_default.map(|m| m.as_str()).unwrap_or("off"),
                current_pending.map(|m| m.as_str()).unwrap_or("none"),
            ),
            "mode-status",
            true,
        )
        .await;
        return Ok(());
    }

    if chat_role == ChatRole::Readonly {
        gw.send(
            turn,
            "permission denied: readonly chat cannot change routing mode.\nread-only: /mode (status only)",
            "mode-deny",
            true,
        )
        .await;
        return Ok(());
    }

    if requested == ModeSetting::Off {
        let existed_default = state.clear_default_mode(&turn.chat_id);
        let cleared_pending = state.clear_pending_mode(&turn.chat_id);
        let cleared_confirm = state.clear_confirm_action(&turn.chat_id);
        gw.persist(state);
        gw.send(
            turn,
            &format!(
                "routing mode updated\n- default_mode: off\n- changed: {}\n- one_shot_pending_cleared: {}\n- confirm_request_cleared: {}",
                if existed_default { "yes" } else { "no" },
                if cleared_pending { "yes" } else { "no" },
                if cleared_confirm { "yes" } else { "no" },
            ),
            "mode-off",
            true,
        )
        .await;
        return Ok(());
    }

    let mode = match requested {
        ModeSetting::Dispatch => RunMode::Dispatch,
        ModeSetting::Direct => RunMode::Direct,
        _ => unreachable!("status/off/invalid handled above"),
    };
    state.set_default_mode(&turn.chat_id, mode);
    gw.persist(state);
    gw.send(
        turn,
        &format!(
            "routing mode updated\n- default_mode: {}\n- one_shot_pending: {}\n- input_behavior: plain text -> {}\n- disable: /mode off (or /off)",
            mode.as_str(),
            current_pending.map(|m| m.as_str()).unwrap_or("none"),
            mode.as_str(),
        ),
        "mode-set",
        true,
    )
    .await;
    Ok(())
}

async fn handle_whoami(gw: &mut Gateway, turn: &Turn, state: &ManagerState, current_chat_alias: &str) {
    let current_allow = if !gw.cfg.acl.allow.is_empty() {
        gw.cfg.acl.allow.iter().cloned().collect::<Vec<_>>().join(",")
    } else if gw.cfg.deny_by_default {
        "(empty: locked)".to_string()
    } else {
        "(empty: all chats allowed)".to_string()
    };
    let role = gw.resolve_chat_role(&turn.chat_id);
    let owner = {
        let o = gw.cfg.acl.owner_chat_id.trim();
        if o.is_empty() { "(unset)" } else { o }
    };
    let body = format!(
        "telegram identity\n- chat_id: {}\n- alias: {}\n- role: {}\n- owner_chat_id: {}\n- is_owner: {}\n- allowlist: {}\n- deny_by_default: {}\n- default_mode: {}\n- one_shot_pending: {}\n- lock: /lockme\n- mode: /mode\n- acl: /acl",
        turn.chat_id,
        if current_chat_alias.is_empty() { "-" } else { current_chat_alias },
        role.as_str(),
        owner,
        if gw.is_owner_chat(&turn.chat_id) { "yes" } else { "no" },
        current_allow,
        if gw.cfg.deny_by_default { "yes" } else { "no" },
        state.default_mode(&turn.chat_id).map(|m| m.as_str()).unwrap_or("off"),
        state.pending_mode(&turn.chat_id).map(|m| m.as_str()).unwrap_or("none"),
    );
    gw.send(turn, &body, "whoami", true).await;
}

async fn handle_acl(gw: &mut Gateway, turn: &Turn, current_chat_alias: &str) {
    let mut ids: Vec<String> = gw.cfg.acl.allow.iter().cloned().collect();
    ids.extend(gw.cfg.acl.admin.iter().cloned());
    ids.extend(gw.cfg.acl.readonly.iter().cloned());
    ids.push(turn.chat_id.clone());
    gw.aliases
        .ensure_many(ids.iter().map(String::as_str), !gw.cfg.dry_run);

    let fmt = |set: &std::collections::BTreeSet<String>| {
        let csv = crate::acl::format_csv_set(set);
        if csv.is_empty() { "(empty)".to_string() } else { csv }
    };
    let role = gw.resolve_chat_role(&turn.chat_id);
    let my_alias = {
        let found = gw.aliases.find(&turn.chat_id);
        if !found.is_empty() {
            found
        } else if !current_chat_alias.is_empty() {
            current_chat_alias.to_string()
        } else {
            "-".to_string()
        }
    };
    let body = format!(
        "access control list\n- deny_by_default: {}\n- my_chat_id: {}\n- my_alias: {}\n- my_role: {}\n- owner_chat_id: {}\n- allow: {}\n- admin: {}\n- readonly: {}\n- aliases: {}\ncommands:\n- /grant <allow|admin|readonly> <chat_id|alias>\n- /revoke <allow|admin|readonly|all> <chat_id|alias>",
        if gw.cfg.deny_by_default { "yes" } else { "no" },
        turn.chat_id,
        my_alias,
        role.as_str(),
        {
            let o = gw.cfg.acl.owner_chat_id.trim();
            if o.is_empty() { "(unset)" } else { o }
        },
        fmt(&gw.cfg.acl.allow),
        fmt(&gw.cfg.acl.admin),
        fmt(&gw.cfg.acl.readonly),
        gw.aliases.table_summary(&gw.cfg.acl, gw.cfg.deny_by_default, 30),
    );
    gw.send(turn, &body, "acl", true).await;
}

async fn handle_grant(gw: &mut Gateway, turn: &Turn, resolved: &ResolvedCommand) -> Result<(), GatewayError> {
    let scope = resolved.acl_grant_scope.clone().unwrap_or_default().to_lowercase();
    let target_ref = resolved.acl_grant_chat_id.clone().unwrap_or_default();
    if scope.is_empty() || target_ref.is_empty() {
        return Err(GatewayError::usage("usage: aoe grant <allow|admin|readonly> <chat_id|alias>"));
    }
    if !matches!(scope.as_str(), "allow" | "admin" | "readonly") {
        return Err(GatewayError::usage("usage: aoe grant <allow|admin|readonly> <chat_id|alias>"));
    }

    let (target_chat_id, mut target_alias) = gw.aliases.resolve_ref(&target_ref, !gw.cfg.dry_run)?;
    gw.cfg.acl.grant(&scope, &target_chat_id);
    if target_alias.is_empty() {
        target_alias = gw.aliases.ensure(&target_chat_id, !gw.cfg.dry_run);
    }

    if !gw.cfg.dry_run {
        sync_acl_env_file(&gw.cfg.team_dir, &gw.cfg.acl)?;
    }

    let target_role = resolve_role_from_acl_sets(&target_chat_id, &gw.cfg.acl, gw.cfg.deny_by_default);
    gw.log_event(
        turn,
        "acl_update",
        EventFields {
            stage: "intake",
            status: "completed",
            detail: &format!(
                "action=grant scope={} target={} alias={} by={}",
                scope,
                target_chat_id,
                if target_alias.is_empty() { "-" } else { target_alias.as_str() },
                turn.chat_id
            ),
            ..EventFields::default()
        },
    );
    let target_display = if target_alias.is_empty() {
        target_chat_id.clone()
    } else {
        format!("{} ({})", target_alias, target_chat_id)
    };
    gw.send(
        turn,
        &format!(
            "acl updated\n- action: grant\n- scope: {}\n- target: {}\n- role_now: {}",
            scope,
            target_display,
            target_role.as_str()
        ),
        "grant",
        true,
    )
    .await;
    Ok(())
}

async fn handle_revoke(gw: &mut Gateway, turn: &Turn, resolved: &ResolvedCommand) -> Result<(), GatewayError> {
    let scope = resolved.acl_revoke_scope.clone().unwrap_or_default().to_lowercase();
    let target_ref = resolved.acl_revoke_chat_id.clone().unwrap_or_default();
    if scope.is_empty() || target_ref.is_empty() {
        return Err(GatewayError::usage("usage: aoe revoke <allow|admin|readonly|all> <chat_id|alias>"));
    }
    if !matches!(scope.as_str(), "allow" | "admin" | "readonly" | "all") {
        return Err(GatewayError::usage("usage: aoe revoke <allow|admin|readonly|all> <chat_id|alias>"));
    }
    let (target_chat_id, target_alias) = gw.aliases.resolve_ref(&target_ref, !gw.cfg.dry_run)?;

    let mut next = gw.cfg.acl.clone();
    next.revoke(&scope, &target_chat_id);

    // Self-revoke guard: in deny-by-default mode a non-owner must not drop
    // their own admin access.
    if gw.cfg.deny_by_default && target_chat_id == turn.chat_id && !gw.is_owner_chat(&turn.chat_id) {
        let caller_after = resolve_role_from_acl_sets(&turn.chat_id, &next, true);
        if caller_after != ChatRole::Admin {
            gw.send(
                turn,
                "blocked: self-revoke would remove admin access in deny-by-default mode.\nnext: /grant admin <other_chat_id|alias> 후 다시 시도하세요.",
                "revoke-guard",
                true,
            )
            .await;
            return Ok(());
        }
    }

    gw.cfg.acl = next;
    if !gw.cfg.dry_run {
        sync_acl_env_file(&gw.cfg.team_dir, &gw.cfg.acl)?;
    }

    let target_role = resolve_role_from_acl_sets(&target_chat_id, &gw.cfg.acl, gw.cfg.deny_by_default);
    gw.log_event(
        turn,
        "acl_update",
        EventFields {
            stage: "intake",
            status: "completed",
            detail: &format!(
                "action=revoke scope={} target={} alias={} by={}",
                scope,
                target_chat_id,
                if target_alias.is_empty() { "-" } else { target_alias.as_str() },
                turn.chat_id
            ),
            ..EventFields::default()
        },
    );
    let target_display = if target_alias.is_empty() {
        target_chat_id.clone()
    } else {
        format!("{} ({})", target_alias, target_chat_id)
    };
    gw.send(
        turn,
        &format!(
            "acl updated\n- action: revoke\n- scope: {}\n- target: {}\n- role_now: {}",
            scope,
            target_display,
            target_role.as_str()
        ),
        "revoke",
        true,
    )
    .await;
    Ok(())
}

async fn handle_lockme(gw: &mut Gateway, turn: &Turn) {
    let fmt_prev = |set: &std::collections::BTreeSet<String>| {
        if set.is_empty() {
            "-".to_string()
        } else {
            set.iter().cloned().collect::<Vec<_>>().join(",")
        }
    };
    let prev_allow = fmt_prev(&gw.cfg.acl.allow);
    let prev_admin = fmt_prev(&gw.cfg.acl.admin);
    let prev_readonly = fmt_prev(&gw.cfg.acl.readonly);
    let prev_owner = {
        let o = gw.cfg.acl.owner_chat_id.trim().to_string();
        if o.is_empty() { "-".to_string() } else { o }
    };

    gw.cfg.acl.lock_to(&turn.chat_id);

    let mut persist_error = String::new();
    if !gw.cfg.dry_run {
        if let Err(e) = sync_acl_env_file(&gw.cfg.team_dir, &gw.cfg.acl) {
            persist_error = e.to_string();
        }
    }

    gw.log_event(
        turn,
        "allowlist_update",
        EventFields {
            stage: "intake",
            status: if persist_error.is_empty() { "completed" } else { "partial" },
            error_code: if persist_error.is_empty() { "" } else { ERROR_INTERNAL },
            detail: &format!(
                "prev_allow={} prev_admin={} prev_readonly={} prev_owner={} next_allow={} next_owner={}",
                prev_allow, prev_admin, prev_readonly, prev_owner, turn.chat_id, turn.chat_id
            ),
            ..EventFields::default()
        },
    );

    let mut msg = format!(
        "access locked to current chat.\n- allowed_chat_id: {}\n- owner_chat_id: {}\n- cleared_admin_readonly: yes\n- apply_now: yes\n- persist_on_restart: {}",
        turn.chat_id,
        turn.chat_id,
        if persist_error.is_empty() { "yes" } else { "no" }
    );
    if !persist_error.is_empty() {
        msg.push_str(&format!(
            "\n- persist_error: {}",
            persist_error.chars().take(180).collect::<String>()
        ));
    }
    gw.send(turn, &msg, "lockme", true).await;
}
