//! Per-chat ephemeral session rows: routing modes, pending confirmation,
//! recent/selected task refs. Rows are created lazily and dropped once empty.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use super::project::normalize_project_name;
use super::state::ManagerState;
use super::{v_str, RunMode};
use crate::util::now_iso;

const RECENT_REFS_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmAction {
    pub mode: RunMode,
    pub prompt: String,
    pub requested_at: String,
    pub risk: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orch: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatSession {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_mode: Option<RunMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<RunMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_action: Option<ConfirmAction>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub recent_task_refs: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub selected_task_refs: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub updated_at: String,
}

impl ChatSession {
    /// True when nothing but `updated_at` would be persisted.
    pub fn is_empty(&self) -> bool {
        self.pending_mode.is_none()
            && self.default_mode.is_none()
            && self.confirm_action.is_none()
            && self.recent_task_refs.is_empty()
            && self.selected_task_refs.is_empty()
    }
}

/// Rebuilds a session row from untrusted JSON; returns `None` when nothing
/// valid remains.
pub fn sanitize_chat_session_row(raw: &Value) -> Option<ChatSession> {
    if !raw.is_object() {
        return None;
    }

    let mut row = ChatSession::default();
    row.pending_mode = RunMode::parse(&v_str(raw, "pending_mode"));
    row.default_mode = RunMode::parse(&v_str(raw, "default_mode"));

    if let Some(confirm) = raw.get("confirm_action").filter(|v| v.is_object()) {
        let mode = RunMode::parse(&v_str(confirm, "mode"));
        let prompt = v_str(confirm, "prompt");
        if let (Some(mode), false) = (mode, prompt.is_empty()) {
            let requested_at = {
                let t = v_str(confirm, "requested_at");
                if t.is_empty() { now_iso() } else { t }
            };
            let orch = {
                let o = v_str(confirm, "orch");
                if o.is_empty() { None } else { Some(o) }
            };
            row.confirm_action = Some(ConfirmAction {
                mode,
                prompt: prompt.chars().take(2000).collect(),
                requested_at,
                risk: v_str(confirm, "risk").chars().take(80).collect(),
                orch,
            });
        }
    }

    if let Some(recent) = raw.get("recent_task_refs").and_then(Value::as_object) {
        for (pname, refs) in recent {
            let key = normalize_project_name(pname);
            let Some(items) = refs.as_array() else { continue };
            let mut dedup: Vec<String> = Vec::new();
            for item in items {
                let rid = item.as_str().unwrap_or_default().trim().to_string();
                if rid.is_empty() || dedup.contains(&rid) {
                    continue;
                }
                dedup.push(rid);
                if dedup.len() >= RECENT_REFS_LIMIT {
                    break;
                }
            }
            if !key.is_empty() && !dedup.is_empty() {
                row.recent_task_refs.insert(key, dedup);
            }
        }
    }

    if let Some(selected) = raw.get("selected_task_refs").and_then(Value::as_object) {
        for (pname, rid) in selected {
            let key = normalize_project_name(pname);
            let request_id = rid.as_str().unwrap_or_default().trim().to_string();
            if !key.is_empty() && !request_id.is_empty() {
                row.selected_task_refs.insert(key, request_id);
            }
        }
    }

    if row.is_empty() {
        return None;
    }
    row.updated_at = {
        let t = v_str(raw, "updated_at");
        if t.is_empty() { now_iso() } else { t }
    };
    Some(row)
}

impl ManagerState {
    fn session(&self, chat_id: &str) -> Option<&ChatSession> {
        self.chat_sessions.get(chat_id.trim())
    }

    fn session_mut(&mut self, chat_id: &str) -> Option<&mut ChatSession> {
        let token = chat_id.trim().to_string();
        if token.is_empty() {
            return None;
        }
        Some(self.chat_sessions.entry(token).or_default())
    }

    fn drop_session_if_empty(&mut self, chat_id: &str) {
        let token = chat_id.trim();
        if self.chat_sessions.get(token).map(ChatSession::is_empty).unwrap_or(false) {
            self.chat_sessions.remove(token);
        }
    }

    pub fn pending_mode(&self, chat_id: &str) -> Option<RunMode> {
        self.session(chat_id).and_then(|row| row.pending_mode)
    }

    pub fn set_pending_mode(&mut self, chat_id: &str, mode: RunMode) {
        if let Some(row) = self.session_mut(chat_id) {
            row.pending_mode = Some(mode);
            row.updated_at = now_iso();
        }
    }

    /// Clears the one-shot mode; returns whether it existed.
    pub fn clear_pending_mode(&mut self, chat_id: &str) -> bool {
        let existed = match self.chat_sessions.get_mut(chat_id.trim()) {
            Some(row) => {
                let existed = row.pending_mode.take().is_some();
                if existed {
                    row.updated_at = now_iso();
                }
                existed
            }
            None => false,
        };
        self.drop_session_if_empty(chat_id);
        existed
    }

    pub fn default_mode(&self, chat_id: &str) -> Option<RunMode> {
        self.session(chat_id).and_then(|row| row.default_mode)
    }

    pub fn set_default_mode(&mut self, chat_id: &str, mode: RunMode) {
        if let Some(row) = self.session_mut(chat_id) {
            row.default_mode = Some(mode);
            row.updated_at = now_iso();
        }
    }

    pub fn clear_default_mode(&mut self, chat_id: &str) -> bool {
        let existed = match self.chat_sessions.get_mut(chat_id.trim()) {
            Some(row) => {
                let existed = row.default_mode.take().is_some();
                if existed {
                    row.updated_at = now_iso();
                }
                existed
            }
            None => false,
        };
        self.drop_session_if_empty(chat_id);
        existed
    }

    pub fn confirm_action(&self, chat_id: &str) -> Option<&ConfirmAction> {
        self.session(chat_id)
            .and_then(|row| row.confirm_action.as_ref())
            .filter(|c| !c.prompt.trim().is_empty())
    }

    pub fn set_confirm_action(&mut self, chat_id: &str, mode: RunMode, prompt: &str, risk: &str, orch: &str) {
        let text = prompt.trim();
        if text.is_empty() {
            return;
        }
        if let Some(row) = self.session_mut(chat_id) {
            row.confirm_action = Some(ConfirmAction {
                mode,
                prompt: text.chars().take(2000).collect(),
                requested_at: now_iso(),
                risk: risk.trim().chars().take(80).collect(),
                orch: {
                    let o = orch.trim();
                    if o.is_empty() { None } else { Some(o.to_string()) }
                },
            });
            row.updated_at = now_iso();
        }
    }

    pub fn clear_confirm_action(&mut self, chat_id: &str) -> bool {
        let existed = match self.chat_sessions.get_mut(chat_id.trim()) {
            Some(row) => {
                let existed = row.confirm_action.take().is_some();
                if existed {
                    row.updated_at = now_iso();
                }
                existed
            }
            None => false,
        };
        self.drop_session_if_empty(chat_id);
        existed
    }

    pub fn recent_task_refs(&self, chat_id: &str, project_name: &str) -> Vec<String> {
        self.session(chat_id)
            .and_then(|row| row.recent_task_refs.get(&normalize_project_name(project_name)))
            .map(|refs| {
                refs.iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replaces the recent list (dedup, cap 50); a selected ref no longer in
    /// the list is dropped.
    pub fn set_recent_task_refs(&mut self, chat_id: &str, project_name: &str, refs: &[String]) {
        let key = normalize_project_name(project_name);
        let Some(row) = self.session_mut(chat_id) else { return };

        let mut dedup: Vec<String> = Vec::new();
        for item in refs {
            let rid = item.trim().to_string();
            if rid.is_empty() || dedup.contains(&rid) {
                continue;
            }
            dedup.push(rid);
            if dedup.len() >= RECENT_REFS_LIMIT {
                break;
            }
        }

        if dedup.is_empty() {
            row.recent_task_refs.remove(&key);
        } else {
            row.recent_task_refs.insert(key.clone(), dedup.clone());
        }

        let selected_stale = row
            .selected_task_refs
            .get(&key)
            .map(|current| !dedup.contains(current))
            .unwrap_or(false);
        if selected_stale {
            row.selected_task_refs.remove(&key);
        }

        row.updated_at = now_iso();
        self.drop_session_if_empty(chat_id);
    }

    /// Moves a request id to the front of the recent list.
    pub fn touch_recent_task_ref(&mut self, chat_id: &str, project_name: &str, request_id: &str) {
        let rid = request_id.trim().to_string();
        if rid.is_empty() {
            return;
        }
        let mut merged = vec![rid.clone()];
        merged.extend(
            self.recent_task_refs(chat_id, project_name)
                .into_iter()
                .filter(|x| *x != rid),
        );
        merged.truncate(RECENT_REFS_LIMIT);
        self.set_recent_task_refs(chat_id, project_name, &merged);
    }

    pub fn selected_task_ref(&self, chat_id: &str, project_name: &str) -> String {
        self.session(chat_id)
            .and_then(|row| row.selected_task_refs.get(&normalize_project_name(project_name)))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    pub fn set_selected_task_ref(&mut self, chat_id: &str, project_name: &str, request_id: &str) {
        let key = normalize_project_name(project_name);
        let rid = request_id.trim().to_string();
        let Some(row) = self.session_mut(chat_id) else { return };
        if rid.is_empty() {
            row.selected_task_refs.remove(&key);
        } else {
            row.selected_task_refs.insert(key, rid);
        }
        row.updated_at = now_iso();
        self.drop_session_if_empty(chat_id);
    }

    /// Resolves a numeric 1-based ref into the recent list; non-numeric refs
    /// pass through untouched.
    pub fn resolve_chat_task_ref(&self, chat_id: &str, project_name: &str, raw_ref: &str) -> String {
        let token = raw_ref.trim();
        if token.is_empty() {
            return String::new();
        }
        if token.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(idx) = token.parse::<usize>() {
                let refs = self.recent_task_refs(chat_id, project_name);
                if idx >= 1 && idx <= refs.len() {
                    return refs[idx - 1].clone();
                }
            }
        }
        token.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::default_manager_state;
    use serde_json::json;
    use std::path::Path;

    fn state() -> ManagerState {
        default_manager_state(Path::new("/tmp/p"), Path::new("/tmp/p/.aoe-team"))
    }

    #[test]
    fn pending_mode_round_trip_and_row_cleanup() {
        let mut s = state();
        s.set_pending_mode("100000", RunMode::Dispatch);
        assert_eq!(s.pending_mode("100000"), Some(RunMode::Dispatch));
        assert!(s.clear_pending_mode("100000"));
        assert!(!s.clear_pending_mode("100000"));
        assert!(s.chat_sessions.is_empty(), "empty row must be dropped");
    }

    #[test]
    fn default_mode_survives_pending_clear() {
        let mut s = state();
        s.set_default_mode("100000", RunMode::Direct);
        s.set_pending_mode("100000", RunMode::Dispatch);
        assert!(s.clear_pending_mode("100000"));
        assert_eq!(s.default_mode("100000"), Some(RunMode::Direct));
        assert!(!s.chat_sessions.is_empty());
    }

    #[test]
    fn confirm_action_requires_prompt() {
        let mut s = state();
        s.set_confirm_action("100000", RunMode::Dispatch, "  ", "risk", "");
        assert!(s.confirm_action("100000").is_none());
        s.set_confirm_action("100000", RunMode::Dispatch, "rm -rf /x", "destructive_delete", "");
        let confirm = s.confirm_action("100000").unwrap();
        assert_eq!(confirm.risk, "destructive_delete");
        assert!(s.clear_confirm_action("100000"));
        assert!(s.chat_sessions.is_empty());
    }

    #[test]
    fn recent_refs_dedupe_and_cap() {
        let mut s = state();
        let refs: Vec<String> = (0..60).map(|i| format!("req-{}", i)).collect();
        s.set_recent_task_refs("100000", "default", &refs);
        assert_eq!(s.recent_task_refs("100000", "default").len(), 50);

        s.touch_recent_task_ref("100000", "default", "req-5");
        let refs = s.recent_task_refs("100000", "default");
        assert_eq!(refs[0], "req-5");
        assert_eq!(refs.iter().filter(|r| *r == "req-5").count(), 1);
    }

    #[test]
    fn touch_same_ref_is_idempotent_on_length() {
        let mut s = state();
        s.touch_recent_task_ref("100000", "default", "req-1");
        s.touch_recent_task_ref("100000", "default", "req-1");
        assert_eq!(s.recent_task_refs("100000", "default").len(), 1);
    }

    #[test]
    fn selected_ref_dropped_when_no_longer_recent() {
        let mut s = state();
        s.set_recent_task_refs("100000", "default", &["req-1".into(), "req-2".into()]);
        s.set_selected_task_ref("100000", "default", "req-2");
        s.set_recent_task_refs("100000", "default", &["req-1".into()]);
        assert_eq!(s.selected_task_ref("100000", "default"), "");
    }

    #[test]
    fn numeric_ref_resolves_into_recent_list() {
        let mut s = state();
        s.set_recent_task_refs("100000", "default", &["req-a".into(), "req-b".into()]);
        assert_eq!(s.resolve_chat_task_ref("100000", "default", "2"), "req-b");
        assert_eq!(s.resolve_chat_task_ref("100000", "default", "9"), "9");
        assert_eq!(s.resolve_chat_task_ref("100000", "default", "req-z"), "req-z");
    }

    #[test]
    fn sanitize_drops_empty_rows_and_keeps_valid_fields() {
        assert!(sanitize_chat_session_row(&json!({"updated_at": "x"})).is_none());
        assert!(sanitize_chat_session_row(&json!("nope")).is_none());

        let row = sanitize_chat_session_row(&json!({
            "pending_mode": "weird",
            "default_mode": "dispatch",
            "confirm_action": {"mode": "dispatch", "prompt": "", "risk": "r"},
            "recent_task_refs": {"Demo App": ["a", "a", "b"], "": ["x"]},
            "selected_task_refs": {"demo_app": "a"},
        }))
        .unwrap();
        assert!(row.pending_mode.is_none());
        assert_eq!(row.default_mode, Some(RunMode::Dispatch));
        assert!(row.confirm_action.is_none(), "confirm without prompt is invalid");
        assert_eq!(row.recent_task_refs.get("demo_app").unwrap(), &vec!["a".to_string(), "b".to_string()]);
        assert_eq!(row.selected_task_refs.get("demo_app").map(String::as_str), Some("a"));
    }
}
