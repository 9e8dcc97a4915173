//! Rate and risk guards: per-chat usage scans and confirmation-token expiry.

use chrono::Utc;

use crate::store::{ConfirmAction, ManagerState, TaskStatus};
use crate::util::{date_key_from_iso, parse_iso_ts, today_key_local};

/// Counts `(running, submitted_today)` across every project for the tasks a
/// chat initiated. Running means overall status pending or running.
pub fn summarize_chat_usage(state: &ManagerState, chat_id: &str) -> (usize, usize) {
    let cid = chat_id.trim();
    if cid.is_empty() {
        return (0, 0);
    }
    let today = today_key_local();
    let mut running = 0usize;
    let mut submitted_today = 0usize;
    for entry in state.projects.values() {
        for task in entry.tasks.values() {
            if task.initiator_chat_id.trim() != cid {
                continue;
            }
            if matches!(task.status, TaskStatus::Pending | TaskStatus::Running) {
                running += 1;
            }
            if date_key_from_iso(&task.created_at) == today {
                submitted_today += 1;
            }
        }
    }
    (running, submitted_today)
}

/// A confirmation token expires `ttl_sec` (floored at 30) after it was
/// requested; an unparsable timestamp never expires.
pub fn confirm_expired(confirm: &ConfirmAction, ttl_sec: u64) -> bool {
    let ttl = ttl_sec.max(30) as i64;
    match parse_iso_ts(&confirm.requested_at) {
        Some(created) => (Utc::now() - created.with_timezone(&Utc)).num_seconds() > ttl,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{default_manager_state, RunMode};
    use crate::util::now_iso;
    use std::path::Path;

    fn state_with_tasks() -> ManagerState {
        let mut state = default_manager_state(Path::new("/tmp/p"), Path::new("/tmp/p/.aoe-team"));
        let entry = state.project_mut("default").unwrap();
        for (rid, status, owner) in [
            ("req-1", TaskStatus::Running, "100000"),
            ("req-2", TaskStatus::Pending, "100000"),
            ("req-3", TaskStatus::Completed, "100000"),
            ("req-4", TaskStatus::Running, "200000"),
        ] {
            entry.ensure_task_record(rid, "p", RunMode::Dispatch, &[], &[], false);
            let task = entry.tasks.get_mut(rid).unwrap();
            task.status = status;
            task.initiator_chat_id = owner.to_string();
            task.created_at = now_iso();
        }
        state
    }

    #[test]
    fn usage_counts_only_owned_tasks() {
        let state = state_with_tasks();
        let (running, today) = summarize_chat_usage(&state, "100000");
        assert_eq!(running, 2, "pending and running both count");
        assert_eq!(today, 3);
        let (running, today) = summarize_chat_usage(&state, "200000");
        assert_eq!(running, 1);
        assert_eq!(today, 1);
        assert_eq!(summarize_chat_usage(&state, ""), (0, 0));
    }

    #[test]
    fn old_tasks_do_not_count_toward_daily_cap() {
        let mut state = state_with_tasks();
        let entry = state.project_mut("default").unwrap();
        entry.tasks.get_mut("req-1").unwrap().created_at = "2020-01-01T00:00:00+0000".to_string();
        let (_, today) = summarize_chat_usage(&state, "100000");
        assert_eq!(today, 2);
    }

    #[test]
    fn confirm_expiry_respects_ttl() {
        let confirm = ConfirmAction {
            mode: RunMode::Dispatch,
            prompt: "rm -rf /x".into(),
            requested_at: now_iso(),
            risk: "destructive_delete".into(),
            orch: None,
        };
        assert!(!confirm_expired(&confirm, 3600));

        let old = ConfirmAction {
            requested_at: "2020-01-01T00:00:00+0000".into(),
            ..confirm.clone()
        };
        assert!(confirm_expired(&old, 3600));
    }

    #[test]
    fn unparsable_requested_at_never_expires() {
        let confirm = ConfirmAction {
            mode: RunMode::Dispatch,
            prompt: "p".into(),
            requested_at: "garbage".into(),
            risk: "".into(),
            orch: None,
        };
        assert!(!confirm_expired(&confirm, 30));
    }
}
