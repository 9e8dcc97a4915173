//! Manager-state and poller-state files: tolerant loads, atomic saves.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use super::project::{normalize_project_name, ProjectEntry};
use super::session::{sanitize_chat_session_row, ChatSession};
use super::task::sanitize_task_record;
use super::{v_str, write_json_atomic};
use crate::error::GatewayError;
use crate::util::now_iso;

/// The central gateway state: chat sessions plus the project registry.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerState {
    pub version: u32,
    pub active: String,
    pub updated_at: String,
    pub chat_sessions: BTreeMap<String, ChatSession>,
    pub projects: BTreeMap<String, ProjectEntry>,
}

pub fn default_manager_state(project_root: &Path, team_dir: &Path) -> ManagerState {
    let mut projects = BTreeMap::new();
    projects.insert(
        "default".to_string(),
        ProjectEntry::new(
            "default",
            "default",
            &project_root.display().to_string(),
            &team_dir.display().to_string(),
            "",
        ),
    );
    ManagerState {
        version: 1,
        active: "default".to_string(),
        updated_at: now_iso(),
        chat_sessions: BTreeMap::new(),
        projects,
    }
}

fn sanitize_project_entry(key: &str, raw: &Value) -> Option<ProjectEntry> {
    if !raw.is_object() {
        return None;
    }
    let root = v_str(raw, "project_root");
    if root.is_empty() {
        return None;
    }
    let team_dir = {
        let td = v_str(raw, "team_dir");
        if td.is_empty() {
            PathBuf::from(&root).join(".aoe-team").display().to_string()
        } else {
            td
        }
    };

    let mut entry = ProjectEntry::new(key, &v_str(raw, "display_name"), &root, &team_dir, &v_str(raw, "overview"));
    entry.last_request_id = v_str(raw, "last_request_id");

    if let Some(raw_tasks) = raw.get("tasks").and_then(Value::as_object) {
        for (req_id, task) in raw_tasks {
            let rid = req_id.trim().to_string();
            if rid.is_empty() || !task.is_object() {
                continue;
            }
            entry.tasks.insert(rid.clone(), sanitize_task_record(task, &rid));
        }
        entry.trim_tasks();
    }

    if let Some(raw_index) = raw.get("task_alias_index").and_then(Value::as_object) {
        for (akey, rid) in raw_index {
            let key_norm = super::task::normalize_task_alias_key(akey);
            let rid_norm = rid.as_str().unwrap_or_default().trim().to_string();
            if !key_norm.is_empty() && !rid_norm.is_empty() {
                entry.task_alias_index.insert(key_norm, rid_norm);
            }
        }
    }

    entry.task_seq = raw.get("task_seq").and_then(Value::as_u64).unwrap_or(0);

    let created = v_str(raw, "created_at");
    if !created.is_empty() {
        entry.created_at = created;
    }
    let updated = v_str(raw, "updated_at");
    if !updated.is_empty() {
        entry.updated_at = updated;
    }
    Some(entry)
}

/// Loads the manager state, tolerating unreadable or malformed files by
/// resetting to defaults. Tasks, sessions and alias indexes are sanitized
/// row by row; task aliases are backfilled.
pub fn load_manager_state(path: &Path, project_root: &Path, team_dir: &Path) -> ManagerState {
    let fallback = default_manager_state(project_root, team_dir);
    let Ok(content) = std::fs::read_to_string(path) else {
        return fallback;
    };
    let Ok(data) = serde_json::from_str::<Value>(&content) else {
        return fallback;
    };
    if !data.is_object() {
        return fallback;
    }

    let Some(raw_projects) = data.get("projects").and_then(Value::as_object) else {
        return fallback;
    };
    if raw_projects.is_empty() {
        return fallback;
    }

    let mut projects: BTreeMap<String, ProjectEntry> = BTreeMap::new();
    for (raw_key, raw_entry) in raw_projects {
        let key = normalize_project_name(raw_key);
        if key.is_empty() {
            continue;
        }
        if let Some(entry) = sanitize_project_entry(&key, raw_entry) {
            projects.insert(key, entry);
        }
    }
    if projects.is_empty() {
        return fallback;
    }

    let active = {
        let a = normalize_project_name(&v_str(&data, "active"));
        if projects.contains_key(&a) {
            a
        } else {
            projects.keys().next().cloned().unwrap_or_else(|| "default".to_string())
        }
    };

    for entry in projects.values_mut() {
        entry.backfill_task_aliases();
    }

    let mut chat_sessions: BTreeMap<String, ChatSession> = BTreeMap::new();
    if let Some(raw_chat) = data.get("chat_sessions").and_then(Value::as_object) {
        for (k, v) in raw_chat {
            let cid = k.trim().to_string();
            if cid.is_empty() {
                continue;
            }
            if let Some(row) = sanitize_chat_session_row(v) {
                chat_sessions.insert(cid, row);
            }
        }
    }

    ManagerState {
        version: 1,
        active,
        updated_at: {
            let t = v_str(&data, "updated_at");
            if t.is_empty() {
                now_iso()
            } else {
                t
            }
        },
        chat_sessions,
        projects,
    }
}

/// Atomic save; stamps `updated_at`.
pub fn save_manager_state(path: &Path, state: &mut ManagerState) -> std::io::Result<()> {
    state.updated_at = now_iso();
    let value = serde_json::to_value(&*state).unwrap_or(Value::Null);
    write_json_atomic(path, &value)
}

impl ManagerState {
    /// Guarantees the default project exists and every entry has sane task
    /// metadata; resets `active` when it points nowhere.
    pub fn ensure_default_project(&mut self, project_root: &Path, team_dir: &Path) {
        if !self.projects.contains_key("default") {
            self.projects.insert(
                "default".to_string(),
                ProjectEntry::new(
                    "default",
                    "default",
                    &project_root.display().to_string(),
                    &team_dir.display().to_string(),
                    "",
                ),
            );
        }
        for entry in self.projects.values_mut() {
            entry.backfill_task_aliases();
        }
        let active = normalize_project_name(&self.active);
        if !self.projects.contains_key(&active) {
            self.active = "default".to_string();
        }
    }

    /// Resolves a project by name (or the active project) to its key.
    pub fn project_key(&self, name: Option<&str>) -> Result<String, GatewayError> {
        if self.projects.is_empty() {
            return Err(GatewayError::other("no orch projects registered"));
        }
        let key = normalize_project_name(name.unwrap_or(&self.active));
        if self.projects.contains_key(&key) {
            Ok(key)
        } else {
            let known = self.projects.keys().cloned().collect::<Vec<_>>().join(", ");
            Err(GatewayError::other(format!("unknown orch project: {} (known: {})", key, known)))
        }
    }

    pub fn project(&self, key: &str) -> Option<&ProjectEntry> {
        self.projects.get(key)
    }

    pub fn project_mut(&mut self, key: &str) -> Option<&mut ProjectEntry> {
        self.projects.get_mut(key)
    }

    /// Registers (or re-registers) a project, preserving `created_at`, the
    /// overview, the last request id and the task table of any existing
    /// entry with the same key.
    pub fn register_project(
        &mut self,
        name: &str,
        project_root: &Path,
        team_dir: &Path,
        overview: &str,
        set_active: bool,
    ) -> String {
        let key = normalize_project_name(name);
        let mut entry = ProjectEntry::new(
            &key,
            name.trim(),
            &project_root.display().to_string(),
            &team_dir.display().to_string(),
            overview,
        );

        if let Some(existing) = self.projects.get(&key) {
            entry.created_at = existing.created_at.clone();
            if entry.overview.is_empty() {
                entry.overview = existing.overview.clone();
            }
            if !existing.last_request_id.trim().is_empty() {
                entry.last_request_id = existing.last_request_id.clone();
            }
            entry.tasks = existing.tasks.clone();
            entry.trim_tasks();
            entry.task_alias_index = existing.task_alias_index.clone();
            entry.task_seq = existing.task_seq;
        }
        self.projects.insert(key.clone(), entry);

        if set_active {
            self.active = key.clone();
        }
        key
    }
}

/// Poller bookkeeping: telegram update offset + processed counter.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollerState {
    pub offset: i64,
    pub processed: i64,
    pub updated_at: String,
}

pub fn load_poller_state(path: &Path) -> PollerState {
    let Ok(content) = std::fs::read_to_string(path) else {
        return PollerState::default();
    };
    let Ok(data) = serde_json::from_str::<Value>(&content) else {
        return PollerState::default();
    };
    PollerState {
        offset: data.get("offset").and_then(Value::as_i64).unwrap_or(0),
        processed: data.get("processed").and_then(Value::as_i64).unwrap_or(0),
        updated_at: v_str(&data, "updated_at"),
    }
}

pub fn save_poller_state(path: &Path, offset: i64, processed: i64) -> std::io::Result<()> {
    let state = PollerState {
        offset,
        processed,
        updated_at: now_iso(),
    };
    let value = serde_json::to_value(&state).unwrap_or(Value::Null);
    write_json_atomic(path, &value)
}
