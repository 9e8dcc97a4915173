//! The long-poll loop: update iteration in `update_id` order, offset
//! bookkeeping, unauthorized fast-reject with a once-per-chat memo, and the
//! single-message simulation mode.

use std::collections::BTreeSet;

use crate::acl::ensure_chat_allowed;
use crate::app::Gateway;
use crate::error::ERROR_AUTH;
use crate::events::log_gateway_event;
use crate::resolver::is_bootstrap_allowed_command;
use crate::store::{load_poller_state, save_poller_state};
use crate::telegram::Update;

/// `(update_id, chat_id, text)` triples for the message updates in a batch.
pub fn iter_message_updates(updates: &[Update]) -> Vec<(i64, String, String)> {
    let mut out = Vec::new();
    for upd in updates {
        let Some(message) = &upd.message else { continue };
        let chat_id = message
            .chat
            .as_ref()
            .and_then(|c| c.id)
            .map(|id| id.to_string())
            .unwrap_or_default();
        let text = message.text.clone().unwrap_or_default();
        out.push((upd.update_id, chat_id, text));
    }
    out
}

/// Poller owning the offset and the unauthorized-chat memo.
pub struct Poller {
    pub gateway: Gateway,
    offset: i64,
    processed: i64,
    unauthorized_sent: BTreeSet<String>,
}

impl Poller {
    pub fn new(gateway: Gateway) -> Self {
        let state = load_poller_state(&gateway.cfg.state_file);
        Poller {
            gateway,
            offset: state.offset,
            processed: state.processed,
            unauthorized_sent: BTreeSet::new(),
        }
    }

    /// Admission check with the deny-by-default bootstrap exception; sends
    /// the one-time unauthorized reply when a chat is rejected.
    async fn admit(&mut self, update_id: i64, chat_id: &str, text: &str) -> bool {
        let cfg = &self.gateway.cfg;
        let mut allowed = ensure_chat_allowed(chat_id, &cfg.acl, cfg.deny_by_default);
        let acl_empty = cfg.acl.is_empty();
        if !allowed && cfg.deny_by_default && acl_empty && is_bootstrap_allowed_command(text) {
            allowed = true;
        }
        if allowed {
            return true;
        }

        if cfg.verbose {
            eprintln!("[SKIP] unauthorized chat_id={}", chat_id);
        }
        if !self.unauthorized_sent.contains(chat_id) {
            let unauthorized_text = if cfg.deny_by_default && acl_empty {
                "not allowed. gateway is locked. use /lockme to claim this bot."
            } else {
                "not allowed."
            };
            self.gateway.send_plain(chat_id, unauthorized_text, "unauthorized").await;
            let preview = if text.chars().count() <= 200 {
                text.to_string()
            } else {
                format!("{}...", text.chars().take(197).collect::<String>())
            };
            log_gateway_event(
                &self.gateway.cfg.team_dir,
                "unauthorized_message",
                &format!("upd-{}", update_id),
                "",
                "",
                None,
                "intake",
                &format!("telegram:{}", chat_id),
                "rejected",
                ERROR_AUTH,
                0,
                &preview,
            );
            self.unauthorized_sent.insert(chat_id.to_string());
        }
        false
    }

    /// One `getUpdates` batch: handle messages in `update_id` order, then
    /// persist the advanced offset.
    pub async fn run_batch(&mut self) -> bool {
        let updates = match self
            .gateway
            .transport
            .clone()
            .get_updates(self.offset, self.gateway.cfg.poll_timeout_sec)
            .await
        {
            Ok(updates) => updates,
            Err(e) => {
                if self.gateway.cfg.verbose {
                    eprintln!("[ERROR] getUpdates failed: {}", e);
                }
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                return false;
            }
        };

        let mut handled_any = false;
        for (update_id, chat_id, text) in iter_message_updates(&updates) {
            handled_any = true;
            self.offset = self.offset.max(update_id + 1);

            if chat_id.is_empty() || text.is_empty() {
                continue;
            }
            if self.gateway.cfg.verbose {
                let preview = if text.chars().count() <= 120 {
                    text.clone()
                } else {
                    format!("{}...", text.chars().take(117).collect::<String>())
                };
                println!("[UPDATE] update_id={} chat_id={} text={}", update_id, chat_id, preview);
            }

            if !self.admit(update_id, &chat_id, &text).await {
                continue;
            }

            self.gateway
                .handle_text_message(&chat_id, &text, &format!("upd-{}", update_id))
                .await;
            self.processed += 1;
        }

        if handled_any {
            if let Err(e) = save_poller_state(&self.gateway.cfg.state_file, self.offset, self.processed) {
                tracing::warn!(error = %e, "poller state save failed");
            }
        }
        handled_any
    }

    /// Runs until `--once` finishes a batch or the task is cancelled.
    pub async fn run_loop(&mut self) {
        loop {
            self.run_batch().await;
            if self.gateway.cfg.once {
                break;
            }
        }
    }
}

/// Processes a single local text as if it arrived from the platform, with
/// dry-run forced (no sends, no persistence).
pub async fn run_simulation(gateway: &mut Gateway, chat_id: &str, text: &str) {
    if gateway.cfg.verbose {
        println!("[SIM] chat_id={} text={}", chat_id, text);
    }
    let original_dry = gateway.cfg.dry_run;
    gateway.cfg.dry_run = true;
    let trace = format!("sim-{}", std::process::id());
    gateway.handle_text_message(chat_id, text, &trace).await;
    gateway.cfg.dry_run = original_dry;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::{Chat, Message};

    fn update(id: i64, chat: Option<i64>, text: Option<&str>) -> Update {
        Update {
            update_id: id,
            message: chat.map(|cid| Message {
                chat: Some(Chat { id: Some(cid) }),
                text: text.map(str::to_string),
            }),
        }
    }

    #[test]
    fn iter_skips_updates_without_messages() {
        let updates = vec![
            update(1, Some(100000), Some("/help")),
            Update {
                update_id: 2,
                message: None,
            },
            update(3, Some(200000), None),
        ];
        let rows = iter_message_updates(&updates);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], (1, "100000".to_string(), "/help".to_string()));
        assert_eq!(rows[1], (3, "200000".to_string(), String::new()));
    }

    #[test]
    fn offset_invariant_is_max_plus_one() {
        // replayed smaller update ids must never move the offset backwards
        let mut offset = 10i64;
        for update_id in [3i64, 12, 11] {
            offset = offset.max(update_id + 1);
        }
        assert_eq!(offset, 13);
    }
}
