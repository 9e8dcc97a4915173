//! The gateway application object: owns config, clients and the chat alias
//! cache, and drives one inbound message through resolve → auth → handlers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::acl::{ChatRole, READONLY_ALLOWED_COMMANDS};
use crate::aliases::ChatAliases;
use crate::config::GatewayConfig;
use crate::error::{classify_error, format_error_message, GatewayError, ERROR_AUTH, ERROR_COMMAND, ERROR_TELEGRAM};
use crate::events::{log_gateway_event, mask_sensitive_text};
use crate::handlers;
use crate::llm::LlmClient;
use crate::orch::{OrchClient, ProjectPaths};
use crate::resolver::{resolve_message_command, Cmd};
use crate::store::{load_manager_state, save_manager_state, ManagerState, TaskRecord};
use crate::telegram::{build_quick_reply_keyboard, split_text, ChatTransport};
use crate::util::int_env_var;

/// Per-message context: trace id, latency clock, and the team dir the event
/// log rows go to (switched when a handler targets another project).
pub struct Turn {
    pub chat_id: String,
    pub trace_id: String,
    pub started: Instant,
    pub log_team_dir: PathBuf,
}

impl Turn {
    pub fn elapsed_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }
}

/// Event row parameters a handler cares about; the rest is filled in by the
/// turn.
#[derive(Default)]
pub struct EventFields<'a> {
    pub project: &'a str,
    pub request_id: &'a str,
    pub task: Option<&'a TaskRecord>,
    pub stage: &'a str,
    pub status: &'a str,
    pub error_code: &'a str,
    pub detail: &'a str,
}

pub struct Gateway {
    pub cfg: GatewayConfig,
    pub transport: Arc<dyn ChatTransport>,
    pub orch: Arc<dyn OrchClient>,
    pub llm: Arc<dyn LlmClient>,
    pub aliases: ChatAliases,
}

impl Gateway {
    pub fn new(
        cfg: GatewayConfig,
        transport: Arc<dyn ChatTransport>,
        orch: Arc<dyn OrchClient>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let aliases = ChatAliases::load(cfg.chat_aliases_file.clone());
        Gateway {
            cfg,
            transport,
            orch,
            llm,
            aliases,
        }
    }

    pub fn new_turn(&self, chat_id: &str, trace_id: &str) -> Turn {
        Turn {
            chat_id: chat_id.to_string(),
            trace_id: trace_id.to_string(),
            started: Instant::now(),
            log_team_dir: self.cfg.team_dir.clone(),
        }
    }

    /// One outcome row per terminal branch; suppressed in dry-run.
    pub fn log_event(&self, turn: &Turn, event: &str, fields: EventFields<'_>) {
        if self.cfg.dry_run {
            return;
        }
        log_gateway_event(
            &turn.log_team_dir,
            event,
            &turn.trace_id,
            fields.project,
            fields.request_id,
            fields.task,
            fields.stage,
            &format!("telegram:{}", turn.chat_id),
            fields.status,
            fields.error_code,
            turn.elapsed_ms(),
            fields.detail,
        );
    }

    /// Chunked, retried send; the first chunk may carry the reply keyboard.
    /// Failures are logged, never raised.
    pub async fn send(&self, turn: &Turn, body: &str, context: &str, with_menu: bool) -> bool {
        let retries = int_env_var("AOE_TG_SEND_RETRIES", 2, 0, 8) as u32;
        let base_delay_ms = int_env_var("AOE_TG_SEND_RETRY_DELAY_MS", 300, 50, 5000) as u64;

        let chunks = split_text(body, self.cfg.max_text_chars);
        let markup = build_quick_reply_keyboard();

        let mut attempt = 0u32;
        let mut ok;
        loop {
            attempt += 1;
            ok = self.send_chunks(&turn.chat_id, &chunks, with_menu.then_some(&markup), context).await;
            if ok || attempt > retries {
                break;
            }
            let delay_ms = (base_delay_ms * 2u64.pow(attempt - 1)).min(8000);
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }

        self.log_event(
            turn,
            "send_message",
            EventFields {
                status: if ok { "sent" } else { "failed" },
                error_code: if ok { "" } else { ERROR_TELEGRAM },
                detail: &format!(
                    "context={} with_menu={} chars={} attempts={}",
                    context,
                    if with_menu { "yes" } else { "no" },
                    body.chars().count(),
                    attempt
                ),
                ..EventFields::default()
            },
        );
        ok
    }

    /// One-shot unlogged send (used by the poller's unauthorized reply).
    pub async fn send_plain(&self, chat_id: &str, text: &str, context: &str) -> bool {
        let chunks = split_text(text, self.cfg.max_text_chars);
        self.send_chunks(chat_id, &chunks, None, context).await
    }

    async fn send_chunks(
        &self,
        chat_id: &str,
        chunks: &[String],
        markup: Option<&serde_json::Value>,
        context: &str,
    ) -> bool {
        for (i, chunk) in chunks.iter().enumerate() {
            let reply_markup = if i == 0 { markup } else { None };
            if let Err(e) = self.transport.send_message(chat_id, chunk, reply_markup).await {
                if self.cfg.verbose {
                    eprintln!("[ERROR] sendMessage failed ({}): chat_id={} error={}", context, chat_id, e);
                }
                return false;
            }
        }
        true
    }

    pub fn is_owner_chat(&self, chat_id: &str) -> bool {
        let owner = crate::acl::normalize_owner_chat_id(&self.cfg.acl.owner_chat_id);
        !owner.is_empty() && chat_id.trim() == owner
    }

    pub fn resolve_chat_role(&self, chat_id: &str) -> ChatRole {
        crate::acl::resolve_chat_role(chat_id, &self.cfg.acl, self.cfg.deny_by_default)
    }

    /// Role/command policy gate. Returns true when the command was denied
    /// (reply already sent).
    async fn enforce_command_auth(&self, turn: &Turn, cmd_key: &str, chat_role: ChatRole) -> bool {
        if chat_role == ChatRole::Unknown {
            if !matches!(cmd_key, "start" | "help" | "whoami" | "lockme") {
                self.send(turn, "permission denied: unauthorized chat.", "auth-deny", true).await;
                self.log_event(
                    turn,
                    "auth_denied",
                    EventFields {
                        stage: "intake",
                        status: "rejected",
                        error_code: ERROR_AUTH,
                        detail: &format!("role=unknown cmd={}", cmd_key),
                        ..EventFields::default()
                    },
                );
                return true;
            }
        } else if cmd_key == "lockme"
            && !self.cfg.acl.allow.is_empty()
            && !matches!(chat_role, ChatRole::Admin | ChatRole::Owner)
        {
            self.send(
                turn,
                "permission denied: /lockme is admin-only after initial claim.",
                "auth-deny",
                true,
            )
            .await;
            self.log_event(
                turn,
                "auth_denied",
                EventFields {
                    stage: "intake",
                    status: "rejected",
                    error_code: ERROR_AUTH,
                    detail: &format!("role={} cmd=lockme", chat_role.as_str()),
                    ..EventFields::default()
                },
            );
            return true;
        }

        if matches!(cmd_key, "lockme" | "grant" | "revoke") && !self.cfg.acl.owner_chat_id.trim().is_empty() {
            if !self.is_owner_chat(&turn.chat_id) {
                self.send(
                    turn,
                    &format!(
                        "permission denied: /{} is owner-only.\nowner_chat_id: {}",
                        cmd_key, self.cfg.acl.owner_chat_id
                    ),
                    "auth-deny",
                    true,
                )
                .await;
                self.log_event(
                    turn,
                    "auth_denied",
                    EventFields {
                        stage: "intake",
                        status: "rejected",
                        error_code: ERROR_AUTH,
                        detail: &format!("owner_only cmd={}", cmd_key),
                        ..EventFields::default()
                    },
                );
                return true;
            }
        } else if chat_role == ChatRole::Readonly && !READONLY_ALLOWED_COMMANDS.contains(&cmd_key) {
            self.send(
                turn,
                "permission denied: readonly chat.\nallowed: /status /check /task /monitor /pick /kpi /help /whoami /mode /acl",
                "auth-deny",
                true,
            )
            .await;
            self.log_event(
                turn,
                "auth_denied",
                EventFields {
                    stage: "intake",
                    status: "rejected",
                    error_code: ERROR_AUTH,
                    detail: &format!("role=readonly cmd={}", cmd_key),
                    ..EventFields::default()
                },
            );
            return true;
        }
        false
    }

    /// Resolves the project context for a handler and points the event log
    /// at that project's team dir.
    pub fn get_context(
        &self,
        turn: &mut Turn,
        state: &ManagerState,
        name_override: Option<&str>,
    ) -> Result<(String, ProjectPaths), GatewayError> {
        let key = state.project_key(name_override)?;
        let entry = state.project(&key).expect("resolved project key");
        let paths = ProjectPaths::from(entry);
        turn.log_team_dir = paths.team_dir.clone();
        Ok((key, paths))
    }

    /// Writes the manager state unless dry-run.
    pub fn persist(&self, state: &mut ManagerState) {
        if self.cfg.dry_run {
            return;
        }
        if let Err(e) = save_manager_state(&self.cfg.manager_state_file, state) {
            tracing::warn!(error = %e, "manager state save failed");
        }
    }

    /// Entry point per inbound message: never panics the poller, always
    /// leaves exactly one outcome row.
    pub async fn handle_text_message(&mut self, chat_id: &str, text: &str, trace_id: &str) {
        let mut turn = self.new_turn(chat_id, trace_id);

        let mut state = load_manager_state(&self.cfg.manager_state_file, &self.cfg.project_root, &self.cfg.team_dir);
        state.ensure_default_project(&self.cfg.project_root, &self.cfg.team_dir);
        if let Ok(key) = state.project_key(None) {
            if let Some(entry) = state.project(&key) {
                turn.log_team_dir = entry.team_dir_path();
            }
        }

        if let Err(e) = self.process_message(&mut turn, &mut state, text).await {
            let (code, user_msg, next_step) = classify_error(&e);
            self.send(
                &turn,
                &format_error_message(code, user_msg, next_step, &e.to_string()),
                "handler error",
                true,
            )
            .await;
            self.log_event(
                &turn,
                "handler_error",
                EventFields {
                    stage: "close",
                    status: "failed",
                    error_code: code,
                    detail: &e.to_string(),
                    ..EventFields::default()
                },
            );
        }
    }

    async fn process_message(
        &mut self,
        turn: &mut Turn,
        state: &mut ManagerState,
        text: &str,
    ) -> Result<(), GatewayError> {
        let preview = {
            let raw = text.to_string();
            let cut = if raw.chars().count() <= 200 {
                raw
            } else {
                format!("{}...", raw.chars().take(197).collect::<String>())
            };
            mask_sensitive_text(&cut)
        };
        self.log_event(
            turn,
            "incoming_message",
            EventFields {
                stage: "intake",
                status: "received",
                detail: &preview,
                ..EventFields::default()
            },
        );

        let mut resolved = resolve_message_command(
            text,
            self.cfg.slash_only,
            state,
            &turn.chat_id,
            self.cfg.dry_run,
            &self.cfg.manager_state_file,
        )?;

        if resolved.cmd == Cmd::None && self.cfg.slash_only {
            self.send(
                turn,
                "입력 형식: 슬래시 명령만 지원합니다.\n예시: /dispatch <요청>, /direct <질문>, /mode on, /monitor, /check, /task, /pick, /help\n참고: /dispatch 또는 /direct는 다음 메시지 1회 평문 허용, /mode는 기본 평문 라우팅 모드를 고정합니다.",
                "slash-only-hint",
                true,
            )
            .await;
            self.log_event(
                turn,
                "input_rejected",
                EventFields {
                    stage: "intake",
                    status: "rejected",
                    error_code: ERROR_COMMAND,
                    detail: "slash_only",
                    ..EventFields::default()
                },
            );
            return Ok(());
        }

        let cmd_key = {
            let key = resolved.cmd.key();
            if key.is_empty() {
                "run-default".to_string()
            } else {
                key
            }
        };
        self.log_event(
            turn,
            "command_resolved",
            EventFields {
                stage: "intake",
                status: "accepted",
                detail: &format!("cmd={}", cmd_key),
                ..EventFields::default()
            },
        );

        let chat_role = self.resolve_chat_role(&turn.chat_id);
        if self.enforce_command_auth(turn, &cmd_key, chat_role).await {
            return Ok(());
        }

        let current_chat_alias = self.aliases.ensure(&turn.chat_id, !self.cfg.dry_run);

        if handlers::run::apply_confirm_run_transition(self, turn, state, &mut resolved).await? {
            return Ok(());
        }

        if handlers::management::handle_management_command(self, turn, state, &resolved, chat_role, &current_chat_alias)
            .await?
        {
            return Ok(());
        }
        if handlers::overview::handle_orch_overview_command(self, turn, state, &resolved).await? {
            return Ok(());
        }
        if handlers::task::handle_orch_task_command(self, turn, state, &resolved).await? {
            return Ok(());
        }

        let mut run_transition = handlers::retry::RunTransitionState::default();
        match handlers::retry::resolve_retry_replan_transition(self, turn, state, &resolved).await? {
            Some(transition) if transition.terminal => return Ok(()),
            Some(transition) => {
                handlers::retry::apply_retry_transition(&mut resolved, &mut run_transition, transition);
            }
            None => {}
        }

        if handlers::task::handle_add_role_command(self, turn, state, &resolved).await? {
            return Ok(());
        }

        handlers::run::handle_run_or_unknown_command(self, turn, state, &resolved, &run_transition, text).await?;
        Ok(())
    }
}
