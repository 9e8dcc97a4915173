//! Structured event log: masked append-only JSON lines with size-based
//! rotation. Every handler path lands exactly one outcome row here.

use std::io::Write;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::store::TaskRecord;
use crate::util::{int_env_var, now_iso};

pub const DEFAULT_LOG_MAX_BYTES: i64 = 5 * 1024 * 1024;
pub const DEFAULT_LOG_KEEP_FILES: i64 = 5;
pub const EVENTS_LOG_NAME: &str = "gateway_events.jsonl";

static TELEGRAM_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{8,}:[A-Za-z0-9_-]{20,}\b").expect("token pattern"));
static SECRET_PAIR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(password|passwd|token|api[_-]?key|secret)\s*[:=]\s*([^\s]+)").expect("secret pattern")
});
static BEARER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._=-]+\b").expect("bearer pattern"));

/// Deterministic masking of bot tokens, `key=value` secrets and bearer
/// credentials before anything reaches the log or a reply.
pub fn mask_sensitive_text(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let text = TELEGRAM_TOKEN_RE.replace_all(raw, "[REDACTED_TELEGRAM_TOKEN]");
    let text = SECRET_PAIR_RE.replace_all(&text, |caps: &regex::Captures<'_>| format!("{}=[REDACTED]", &caps[1]));
    let text = BEARER_RE.replace_all(&text, "Bearer [REDACTED]");
    text.into_owned()
}

/// Appends one row, rotating `.1 .. .keep` first when the current file has
/// reached the size cap. Each rename happens before the next so a crash
/// leaves a consistent chain.
pub fn append_jsonl(path: &Path, row: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let max_bytes = int_env_var(
        "AOE_GATEWAY_LOG_MAX_BYTES",
        DEFAULT_LOG_MAX_BYTES,
        64 * 1024,
        256 * 1024 * 1024,
    ) as u64;
    let keep_files = int_env_var("AOE_GATEWAY_LOG_KEEP_FILES", DEFAULT_LOG_KEEP_FILES, 1, 30);

    let current_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if current_size >= max_bytes {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or(EVENTS_LOG_NAME);
        for idx in (1..keep_files).rev() {
            let src = path.with_file_name(format!("{}.{}", name, idx));
            let dst = path.with_file_name(format!("{}.{}", name, idx + 1));
            if src.exists() {
                let _ = std::fs::remove_file(&dst);
                std::fs::rename(&src, &dst)?;
            }
        }
        let first = path.with_file_name(format!("{}.1", name));
        let _ = std::fs::remove_file(&first);
        std::fs::rename(path, &first)?;
    }

    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(row).unwrap_or_else(|_| "{}".to_string());
    f.write_all(line.as_bytes())?;
    f.write_all(b"\n")
}

/// One outcome row. Detail is masked and truncated; the task contributes its
/// short id and alias when present.
#[allow(clippy::too_many_arguments)]
pub fn log_gateway_event(
    team_dir: &Path,
    event: &str,
    trace_id: &str,
    project: &str,
    request_id: &str,
    task: Option<&TaskRecord>,
    stage: &str,
    actor: &str,
    status: &str,
    error_code: &str,
    latency_ms: i64,
    detail: &str,
) {
    let (short_id, alias) = match task {
        Some(task) => (
            task.short_id.clone().unwrap_or_default(),
            task.alias.clone().unwrap_or_default(),
        ),
        None => (String::new(), String::new()),
    };
    let row = json!({
        "timestamp": now_iso(),
        "event": if event.trim().is_empty() { "event" } else { event.trim() },
        "trace_id": trace_id.trim(),
        "project": project.trim(),
        "request_id": request_id.trim(),
        "task_short_id": short_id,
        "task_alias": alias,
        "stage": stage.trim(),
        "actor": if actor.trim().is_empty() { "gateway" } else { actor.trim() },
        "status": status.trim(),
        "error_code": error_code.trim(),
        "latency_ms": latency_ms.max(0),
        "detail": mask_sensitive_text(detail.trim()).chars().take(800).collect::<String>(),
    });
    if let Err(e) = append_jsonl(&team_dir.join("logs").join(EVENTS_LOG_NAME), &row) {
        tracing::warn!(error = %e, "event log append failed");
    }
}
