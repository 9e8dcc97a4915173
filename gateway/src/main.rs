//! `aoe-telegram-gateway` binary: flag/env resolution, startup validation,
//! instance locking, then the poll loop or a one-shot simulation.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use gateway::acl::{normalize_owner_chat_id, parse_csv_set, AclSets};
use gateway::app::Gateway;
use gateway::config::{
    GatewayConfig, DEFAULT_CHAT_DAILY_CAP, DEFAULT_CHAT_MAX_RUNNING, DEFAULT_CONFIRM_TTL_SEC,
    DEFAULT_HTTP_TIMEOUT_SEC, DEFAULT_ORCH_COMMAND_TIMEOUT_SEC, DEFAULT_ORCH_POLL_SEC,
    DEFAULT_ORCH_TIMEOUT_SEC, DEFAULT_POLL_TIMEOUT_SEC, DEFAULT_TASK_PLAN_MAX_SUBTASKS,
    DEFAULT_TASK_PLAN_REPLAN_ATTEMPTS,
};
use gateway::llm::LlmExec;
use gateway::lock::acquire_process_lock;
use gateway::orch::OrchExec;
use gateway::poller::{run_simulation, Poller};
use gateway::store::{load_manager_state, save_manager_state};
use gateway::telegram::{ChatTransport, DryRunTransport, TelegramApi, DEFAULT_MAX_TEXT_CHARS};
use gateway::util::{bool_from_env, int_from_env};

#[derive(Parser, Debug)]
#[command(name = "aoe-telegram-gateway")]
#[command(about = "Telegram polling gateway for aoe-orch")]
struct Args {
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", default_value = "")]
    bot_token: String,

    #[arg(long, default_value = ".")]
    project_root: String,
    #[arg(long)]
    team_dir: Option<String>,
    #[arg(long)]
    state_file: Option<String>,
    #[arg(long, env = "AOE_ORCH_MANAGER_STATE")]
    manager_state_file: Option<String>,
    #[arg(long, env = "AOE_CHAT_ALIASES_FILE")]
    chat_aliases_file: Option<String>,
    #[arg(long, env = "AOE_GATEWAY_INSTANCE_LOCK")]
    instance_lock_file: Option<String>,
    #[arg(long, env = "AOE_WORKSPACE_ROOT")]
    workspace_root: Option<String>,

    #[arg(long)]
    owner_chat_id: Option<String>,
    #[arg(long)]
    allow_chat_ids: Option<String>,
    #[arg(long)]
    admin_chat_ids: Option<String>,
    #[arg(long)]
    readonly_chat_ids: Option<String>,

    /// deny all chats unless allowlist matches (bootstrap /lockme when empty)
    #[arg(long)]
    deny_by_default: bool,
    /// legacy mode: allow all chats when allowlist is empty
    #[arg(long)]
    no_deny_by_default: bool,

    #[arg(long, env = "AOE_ORCH_BIN")]
    aoe_orch_bin: Option<String>,
    #[arg(long, env = "AOE_TEAM_BIN")]
    aoe_team_bin: Option<String>,
    #[arg(long, env = "AOE_LLM_BIN", default_value = "codex")]
    llm_bin: String,

    /// fixed role csv passed to aoe-orch run
    #[arg(long)]
    roles: Option<String>,
    #[arg(long, default_value = "P2")]
    priority: String,
    #[arg(long, default_value_t = DEFAULT_ORCH_TIMEOUT_SEC)]
    orch_timeout_sec: u64,
    #[arg(long, default_value_t = DEFAULT_ORCH_POLL_SEC)]
    orch_poll_sec: f64,
    #[arg(long, default_value_t = DEFAULT_ORCH_COMMAND_TIMEOUT_SEC)]
    orch_command_timeout_sec: u64,
    #[arg(long)]
    no_spawn_missing: bool,
    #[arg(long)]
    no_wait: bool,

    /// enable keyword-based automatic dispatch to worker roles
    #[arg(long)]
    auto_dispatch: bool,
    #[arg(long)]
    no_auto_dispatch: bool,

    /// require slash commands (plain text only via pending/default mode)
    #[arg(long)]
    slash_only: bool,
    #[arg(long)]
    no_slash_only: bool,

    /// require verifier-role completion before integration/close
    #[arg(long)]
    require_verifier: bool,
    #[arg(long)]
    no_require_verifier: bool,
    /// comma-separated verifier role names (default: Reviewer,QA,Verifier)
    #[arg(long, env = "AOE_VERIFIER_ROLES")]
    verifier_roles: Option<String>,

    /// enable planner/critic sub-task decomposition before dispatch
    #[arg(long)]
    task_planning: bool,
    #[arg(long)]
    no_task_planning: bool,
    #[arg(long)]
    plan_max_subtasks: Option<usize>,
    /// auto-replan when critic finds blocking issues
    #[arg(long)]
    plan_auto_replan: bool,
    #[arg(long)]
    no_plan_auto_replan: bool,
    #[arg(long)]
    plan_replan_attempts: Option<u32>,
    /// block dispatch if critic issues remain after replanning
    #[arg(long)]
    plan_block_on_critic: bool,
    #[arg(long)]
    no_plan_block_on_critic: bool,

    #[arg(long, default_value_t = DEFAULT_POLL_TIMEOUT_SEC)]
    poll_timeout_sec: u64,
    #[arg(long, default_value_t = DEFAULT_HTTP_TIMEOUT_SEC)]
    http_timeout_sec: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_TEXT_CHARS)]
    max_text_chars: usize,
    /// seconds to keep high-risk auto-run confirmation pending
    #[arg(long)]
    confirm_ttl_sec: Option<u64>,
    /// max concurrent pending/running tasks per chat (0 disables)
    #[arg(long)]
    chat_max_running: Option<usize>,
    /// max tasks created per chat per day (0 disables)
    #[arg(long)]
    chat_daily_cap: Option<usize>,

    #[arg(long)]
    once: bool,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    verbose: bool,

    /// process a single local text message (no telegram polling)
    #[arg(long)]
    simulate_text: Option<String>,
    #[arg(long, default_value = "local-sim")]
    simulate_chat_id: String,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_path(raw: &str) -> PathBuf {
    let expanded = if let Some(rest) = raw.strip_prefix("~/") {
        match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(rest),
            Err(_) => PathBuf::from(raw),
        }
    } else {
        PathBuf::from(raw)
    };
    match expanded.canonicalize() {
        Ok(p) => p,
        Err(_) => expanded,
    }
}

fn resolve_toggle(pos: bool, neg: bool, env_name: &str, default: bool) -> bool {
    if pos {
        return true;
    }
    if neg {
        return false;
    }
    bool_from_env(std::env::var(env_name).ok().as_deref(), default)
}

fn env_or(arg: Option<String>, env_name: &str) -> String {
    arg.or_else(|| std::env::var(env_name).ok()).unwrap_or_default()
}

fn binary_available(bin: &str) -> bool {
    let path = PathBuf::from(bin);
    if path.exists() {
        return true;
    }
    let Ok(path_env) = std::env::var("PATH") else {
        return false;
    };
    path_env.split(':').any(|folder| {
        let candidate = PathBuf::from(folder).join(bin);
        candidate.exists()
    })
}

fn default_local_bin(name: &str) -> String {
    match std::env::var("HOME") {
        Ok(home) => format!("{}/.local/bin/{}", home, name),
        Err(_) => name.to_string(),
    }
}

fn build_config(args: &Args) -> GatewayConfig {
    let project_root = resolve_path(&args.project_root);
    let team_dir = match &args.team_dir {
        Some(dir) => resolve_path(dir),
        None => match std::env::var("AOE_TEAM_DIR") {
            Ok(dir) if !dir.trim().is_empty() => resolve_path(&dir),
            _ => project_root.join(".aoe-team"),
        },
    };

    // Apply ACL seeds persisted by /lockme (existing env still wins).
    let _ = env_config::load_and_apply(&team_dir.join("telegram.env"));

    let mut cfg = GatewayConfig::for_project(&project_root);
    cfg.team_dir = team_dir.clone();
    cfg.state_file = args
        .state_file
        .as_deref()
        .map(resolve_path)
        .unwrap_or_else(|| project_root.join(".aoe-team").join("telegram_gateway_state.json"));
    cfg.manager_state_file = args
        .manager_state_file
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(resolve_path)
        .unwrap_or_else(|| team_dir.join("orch_manager_state.json"));
    cfg.chat_aliases_file = args
        .chat_aliases_file
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(resolve_path)
        .unwrap_or_else(|| team_dir.join("telegram_chat_aliases.json"));
    cfg.instance_lock_file = args
        .instance_lock_file
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(resolve_path)
        .unwrap_or_else(|| team_dir.join(".gateway.instance.lock"));
    cfg.workspace_root = args
        .workspace_root
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(resolve_path);

    let owner_raw = args
        .owner_chat_id
        .clone()
        .or_else(|| std::env::var("TELEGRAM_OWNER_CHAT_ID").ok())
        .or_else(|| std::env::var("AOE_OWNER_CHAT_ID").ok())
        .unwrap_or_default();
    let mut acl = AclSets {
        allow: parse_csv_set(&env_or(args.allow_chat_ids.clone(), "TELEGRAM_ALLOW_CHAT_IDS")),
        admin: parse_csv_set(&env_or(args.admin_chat_ids.clone(), "TELEGRAM_ADMIN_CHAT_IDS")),
        readonly: parse_csv_set(&env_or(args.readonly_chat_ids.clone(), "TELEGRAM_READONLY_CHAT_IDS")),
        owner_chat_id: normalize_owner_chat_id(&owner_raw),
    };
    acl.enforce_disjoint();
    cfg.acl = acl;
    cfg.deny_by_default = resolve_toggle(args.deny_by_default, args.no_deny_by_default, "AOE_DENY_BY_DEFAULT", true);

    cfg.roles = args.roles.clone().unwrap_or_default();
    cfg.priority = args.priority.clone();
    cfg.orch_timeout_sec = args.orch_timeout_sec;
    cfg.orch_poll_sec = args.orch_poll_sec;
    cfg.orch_command_timeout_sec = args.orch_command_timeout_sec;
    cfg.no_spawn_missing = args.no_spawn_missing;
    cfg.no_wait = args.no_wait;

    cfg.auto_dispatch = resolve_toggle(args.auto_dispatch, args.no_auto_dispatch, "AOE_AUTO_DISPATCH", false);
    cfg.slash_only = resolve_toggle(args.slash_only, args.no_slash_only, "AOE_SLASH_ONLY", true);
    cfg.require_verifier = resolve_toggle(args.require_verifier, args.no_require_verifier, "AOE_REQUIRE_VERIFIER", true);
    cfg.verifier_roles = args
        .verifier_roles
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| gateway::roles::DEFAULT_VERIFIER_ROLES.to_string());
    cfg.task_planning = resolve_toggle(args.task_planning, args.no_task_planning, "AOE_TASK_PLANNING", true);
    cfg.plan_max_subtasks = args.plan_max_subtasks.unwrap_or_else(|| {
        int_from_env(
            std::env::var("AOE_PLAN_MAX_SUBTASKS").ok().as_deref(),
            DEFAULT_TASK_PLAN_MAX_SUBTASKS as i64,
            1,
            64,
        ) as usize
    });
    cfg.plan_auto_replan = resolve_toggle(args.plan_auto_replan, args.no_plan_auto_replan, "AOE_PLAN_AUTO_REPLAN", true);
    cfg.plan_replan_attempts = args.plan_replan_attempts.unwrap_or_else(|| {
        int_from_env(
            std::env::var("AOE_PLAN_REPLAN_ATTEMPTS").ok().as_deref(),
            DEFAULT_TASK_PLAN_REPLAN_ATTEMPTS as i64,
            0,
            16,
        ) as u32
    });
    cfg.plan_block_on_critic = resolve_toggle(
        args.plan_block_on_critic,
        args.no_plan_block_on_critic,
        "AOE_PLAN_BLOCK_ON_CRITIC",
        true,
    );

    cfg.poll_timeout_sec = args.poll_timeout_sec;
    cfg.http_timeout_sec = args.http_timeout_sec;
    cfg.max_text_chars = args.max_text_chars;
    cfg.confirm_ttl_sec = args.confirm_ttl_sec.unwrap_or_else(|| {
        int_from_env(
            std::env::var("AOE_CONFIRM_TTL_SEC").ok().as_deref(),
            DEFAULT_CONFIRM_TTL_SEC as i64,
            30,
            86400,
        ) as u64
    });
    cfg.chat_max_running = args.chat_max_running.unwrap_or_else(|| {
        int_from_env(
            std::env::var("AOE_CHAT_MAX_RUNNING").ok().as_deref(),
            DEFAULT_CHAT_MAX_RUNNING as i64,
            0,
            50,
        ) as usize
    });
    cfg.chat_daily_cap = args.chat_daily_cap.unwrap_or_else(|| {
        int_from_env(
            std::env::var("AOE_CHAT_DAILY_CAP").ok().as_deref(),
            DEFAULT_CHAT_DAILY_CAP as i64,
            0,
            10000,
        ) as usize
    });

    cfg.once = args.once;
    cfg.dry_run = args.dry_run;
    cfg.verbose = args.verbose;
    cfg
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();
    let cfg = build_config(&args);

    let token = args.bot_token.trim().to_string();
    if token.is_empty() && args.simulate_text.is_none() {
        eprintln!("[ERROR] missing bot token (set --bot-token or TELEGRAM_BOT_TOKEN)");
        std::process::exit(1);
    }

    let orch_bin = args.aoe_orch_bin.clone().unwrap_or_else(|| default_local_bin("aoe-orch"));
    let team_bin = args.aoe_team_bin.clone().unwrap_or_else(|| default_local_bin("aoe-team"));
    if !binary_available(&orch_bin) {
        eprintln!("[ERROR] aoe-orch binary not found: {}", orch_bin);
        std::process::exit(1);
    }
    if !binary_available(&team_bin) {
        eprintln!("[ERROR] aoe-team binary not found: {}", team_bin);
        std::process::exit(1);
    }

    // Preload + persist once so a fresh install writes its default registry.
    let mut manager_state = load_manager_state(&cfg.manager_state_file, &cfg.project_root, &cfg.team_dir);
    manager_state.ensure_default_project(&cfg.project_root, &cfg.team_dir);
    if !cfg.dry_run {
        if let Err(e) = save_manager_state(&cfg.manager_state_file, &mut manager_state) {
            eprintln!("[ERROR] cannot write manager state: {}", e);
            std::process::exit(1);
        }
    }

    let _lock = if args.simulate_text.is_none() && !cfg.dry_run {
        match acquire_process_lock(&cfg.instance_lock_file) {
            Ok(lock) => Some(lock),
            Err(e) => {
                eprintln!("[ERROR] {}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let transport: Arc<dyn ChatTransport> = if cfg.dry_run || args.simulate_text.is_some() {
        Arc::new(DryRunTransport)
    } else {
        Arc::new(TelegramApi::new(&token, cfg.http_timeout_sec))
    };
    let orch = Arc::new(OrchExec {
        orch_bin,
        team_bin,
        command_timeout_sec: cfg.orch_command_timeout_sec,
    });
    let llm = Arc::new(LlmExec { bin: args.llm_bin.clone() });

    let mut gw = Gateway::new(cfg, transport, orch, llm);

    if let Some(text) = &args.simulate_text {
        run_simulation(&mut gw, &args.simulate_chat_id, text).await;
        return;
    }

    let mut poller = Poller::new(gw);
    tokio::select! {
        _ = poller.run_loop() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::debug!("interrupt received; shutting down");
        }
    }
}
