//! Resolved gateway configuration: paths, ACL seeds, feature toggles and
//! timing knobs, plus the `telegram.env` ACL persistence.

use std::path::{Path, PathBuf};

use crate::acl::{format_csv_set, AclSets};

pub const DEFAULT_POLL_TIMEOUT_SEC: u64 = 25;
pub const DEFAULT_HTTP_TIMEOUT_SEC: u64 = 60;
pub const DEFAULT_ORCH_TIMEOUT_SEC: u64 = 600;
pub const DEFAULT_ORCH_POLL_SEC: f64 = 2.0;
pub const DEFAULT_ORCH_COMMAND_TIMEOUT_SEC: u64 = 900;
pub const DEFAULT_CONFIRM_TTL_SEC: u64 = 300;
pub const DEFAULT_CHAT_MAX_RUNNING: usize = 2;
pub const DEFAULT_CHAT_DAILY_CAP: usize = 40;
pub const DEFAULT_TASK_PLAN_MAX_SUBTASKS: usize = 4;
pub const DEFAULT_TASK_PLAN_REPLAN_ATTEMPTS: u32 = 2;

/// Everything the handlers read; built in `main` from flags + env.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub project_root: PathBuf,
    pub team_dir: PathBuf,
    pub state_file: PathBuf,
    pub manager_state_file: PathBuf,
    pub chat_aliases_file: PathBuf,
    pub instance_lock_file: PathBuf,
    pub workspace_root: Option<PathBuf>,

    pub acl: AclSets,
    pub deny_by_default: bool,

    pub roles: String,
    pub priority: String,
    pub orch_timeout_sec: u64,
    pub orch_poll_sec: f64,
    pub orch_command_timeout_sec: u64,
    pub no_spawn_missing: bool,
    pub no_wait: bool,

    pub auto_dispatch: bool,
    pub slash_only: bool,
    pub require_verifier: bool,
    pub verifier_roles: String,
    pub task_planning: bool,
    pub plan_max_subtasks: usize,
    pub plan_auto_replan: bool,
    pub plan_replan_attempts: u32,
    pub plan_block_on_critic: bool,

    pub poll_timeout_sec: u64,
    pub http_timeout_sec: u64,
    pub max_text_chars: usize,
    pub confirm_ttl_sec: u64,
    pub chat_max_running: usize,
    pub chat_daily_cap: usize,

    pub once: bool,
    pub dry_run: bool,
    pub verbose: bool,
}

impl GatewayConfig {
    /// A sensible default rooted at a project directory; flags override the
    /// rest in `main`, tests patch fields directly.
    pub fn for_project(project_root: &Path) -> Self {
        let project_root = project_root.to_path_buf();
        let team_dir = project_root.join(".aoe-team");
        GatewayConfig {
            state_file: project_root.join(".aoe-team").join("telegram_gateway_state.json"),
            manager_state_file: team_dir.join("orch_manager_state.json"),
            chat_aliases_file: team_dir.join("telegram_chat_aliases.json"),
            instance_lock_file: team_dir.join(".gateway.instance.lock"),
            workspace_root: None,
            project_root,
            team_dir,
            acl: AclSets::default(),
            deny_by_default: true,
            roles: String::new(),
            priority: "P2".to_string(),
            orch_timeout_sec: DEFAULT_ORCH_TIMEOUT_SEC,
            orch_poll_sec: DEFAULT_ORCH_POLL_SEC,
            orch_command_timeout_sec: DEFAULT_ORCH_COMMAND_TIMEOUT_SEC,
            no_spawn_missing: false,
            no_wait: false,
            auto_dispatch: false,
            slash_only: true,
            require_verifier: true,
            verifier_roles: crate::roles::DEFAULT_VERIFIER_ROLES.to_string(),
            task_planning: true,
            plan_max_subtasks: DEFAULT_TASK_PLAN_MAX_SUBTASKS,
            plan_auto_replan: true,
            plan_replan_attempts: DEFAULT_TASK_PLAN_REPLAN_ATTEMPTS,
            plan_block_on_critic: true,
            poll_timeout_sec: DEFAULT_POLL_TIMEOUT_SEC,
            http_timeout_sec: DEFAULT_HTTP_TIMEOUT_SEC,
            max_text_chars: crate::telegram::DEFAULT_MAX_TEXT_CHARS,
            confirm_ttl_sec: DEFAULT_CONFIRM_TTL_SEC,
            chat_max_running: DEFAULT_CHAT_MAX_RUNNING,
            chat_daily_cap: DEFAULT_CHAT_DAILY_CAP,
            once: false,
            dry_run: false,
            verbose: false,
        }
    }
}

/// Persists the ACL seeds into `<team>/telegram.env` via per-key upserts;
/// the owner key is written only when configured.
pub fn sync_acl_env_file(team_dir: &Path, acl: &AclSets) -> std::io::Result<()> {
    let env_path = team_dir.join("telegram.env");
    env_config::upsert_env_var(&env_path, "TELEGRAM_ALLOW_CHAT_IDS", &format_csv_set(&acl.allow))?;
    env_config::upsert_env_var(&env_path, "TELEGRAM_ADMIN_CHAT_IDS", &format_csv_set(&acl.admin))?;
    env_config::upsert_env_var(&env_path, "TELEGRAM_READONLY_CHAT_IDS", &format_csv_set(&acl.readonly))?;
    if !acl.owner_chat_id.trim().is_empty() {
        env_config::upsert_env_var(&env_path, "TELEGRAM_OWNER_CHAT_ID", acl.owner_chat_id.trim())?;
    }
    Ok(())
}
