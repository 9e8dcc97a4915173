//! Persistent gateway state: manager state (projects, tasks, chat sessions)
//! and the poller offset file. All writes go through write-temp-then-rename.

mod project;
mod session;
mod state;
mod task;

pub use project::{is_path_within, normalize_project_name, ProjectEntry};
pub use session::{ChatSession, ConfirmAction};
pub use state::{
    default_manager_state, load_manager_state, load_poller_state, save_manager_state,
    save_poller_state, ManagerState, PollerState,
};
pub use task::{
    dedupe_roles, derive_task_alias_base, format_task_short_id, normalize_task_alias_key,
    parse_task_seq_from_short_id, sanitize_task_record, task_display_label, HistoryEvent, Stage,
    StageMap, StageStatus, TaskRecord, TaskResult, TaskStatus, LIFECYCLE_STAGES,
    TASK_HISTORY_LIMIT, TASK_KEEP_PER_PROJECT,
};

use serde_json::Value;

/// Routing mode for plain-text messages and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Dispatch,
    Direct,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Dispatch => "dispatch",
            RunMode::Direct => "direct",
        }
    }

    pub fn parse(raw: &str) -> Option<RunMode> {
        match raw.trim().to_lowercase().as_str() {
            "dispatch" => Some(RunMode::Dispatch),
            "direct" => Some(RunMode::Direct),
            _ => None,
        }
    }
}

pub(crate) fn v_str(v: &Value, key: &str) -> String {
    v.get(key)
        .map(|x| match x {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        })
        .unwrap_or_default()
}

pub(crate) fn v_bool(v: &Value, key: &str, default: bool) -> bool {
    v.get(key).and_then(Value::as_bool).unwrap_or(default)
}

pub(crate) fn v_i64(v: &Value, key: &str, default: i64) -> i64 {
    v.get(key).and_then(Value::as_i64).unwrap_or(default)
}

pub(crate) fn v_str_list(v: &Value, key: &str) -> Vec<String> {
    v.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|x| x.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Atomic JSON write: temp sibling + rename, trailing newline, pretty form.
pub(crate) fn write_json_atomic(path: &std::path::Path, value: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string());
    std::fs::write(&tmp, format!("{}\n", body))?;
    std::fs::rename(&tmp, path)
}
