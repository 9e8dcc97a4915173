//! Telegram Bot API client: long-poll `getUpdates` and chunked
//! `sendMessage`, behind a transport trait so tests can record sends.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::GatewayError;

pub const DEFAULT_MAX_TEXT_CHARS: usize = 3800;

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    #[serde(default)]
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub chat: Option<Chat>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

/// Splits outgoing text on line boundaries into chunks of at most
/// `max_chars` characters (minimum 200). Over-long single lines are
/// truncated with an ellipsis.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(200);
    let src = text.trim();
    if src.is_empty() {
        return vec!["(empty)".to_string()];
    }
    if src.chars().count() <= max_chars {
        return vec![src.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut buf: Vec<String> = Vec::new();
    let mut size = 0usize;

    for line in src.lines() {
        let line_len = line.chars().count();
        let candidate = if line_len <= max_chars {
            line.to_string()
        } else {
            let mut cut: String = line.chars().take(max_chars - 3).collect();
            cut.push_str("...");
            cut
        };
        let add_len = candidate.chars().count() + usize::from(!buf.is_empty());
        if size + add_len > max_chars && !buf.is_empty() {
            chunks.push(buf.join("\n"));
            buf.clear();
            size = 0;
        }
        size += candidate.chars().count() + usize::from(!buf.is_empty());
        buf.push(candidate);
    }
    if !buf.is_empty() {
        chunks.push(buf.join("\n"));
    }
    chunks
}

/// Persistent reply keyboard listing the core commands; attached to the
/// first chunk of menu-bearing replies.
pub fn build_quick_reply_keyboard() -> Value {
    json!({
        "keyboard": [
            [{"text": "/status"}, {"text": "/check"}],
            [{"text": "/task"}, {"text": "/monitor"}, {"text": "/pick"}],
            [{"text": "/kpi"}, {"text": "/cancel"}],
            [{"text": "/dispatch"}, {"text": "/direct"}],
            [{"text": "/help"}, {"text": "/whoami"}, {"text": "/acl"}, {"text": "/mode"}],
        ],
        "resize_keyboard": true,
        "one_time_keyboard": false,
        "is_persistent": true,
        "input_field_placeholder": "예: /dispatch 결측치 규칙 정리해줘",
    })
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Long-poll for message updates starting at `offset`.
    async fn get_updates(&self, offset: i64, poll_timeout_sec: u64) -> Result<Vec<Update>, GatewayError>;

    /// Sends one already-chunked message body.
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_markup: Option<&Value>,
    ) -> Result<(), GatewayError>;
}

/// HTTPS client against `api.telegram.org`.
pub struct TelegramApi {
    client: reqwest::Client,
    token: String,
    http_timeout_sec: u64,
}

impl TelegramApi {
    pub fn new(token: &str, http_timeout_sec: u64) -> Self {
        TelegramApi {
            client: reqwest::Client::new(),
            token: token.to_string(),
            http_timeout_sec,
        }
    }

    async fn api(&self, method: &str, payload: Value, timeout_sec: u64) -> Result<Value, GatewayError> {
        let url = format!("https://api.telegram.org/bot{}/{}", self.token, method);
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .timeout(Duration::from_secs(timeout_sec.max(1)))
            .send()
            .await
            .map_err(|e| GatewayError::Telegram(format!("Telegram API URL error ({}): {}", method, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Telegram(format!("Telegram API read error ({}): {}", method, e)))?;
        if !status.is_success() {
            return Err(GatewayError::Telegram(format!(
                "Telegram API HTTP error ({}): {}",
                method,
                body.chars().take(300).collect::<String>()
            )));
        }

        let data: Value = serde_json::from_str(&body).map_err(|_| {
            GatewayError::Telegram(format!(
                "Telegram API invalid JSON ({}): {}",
                method,
                body.chars().take(300).collect::<String>()
            ))
        })?;
        if !data.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            return Err(GatewayError::Telegram(format!("Telegram API error ({}): {}", method, data)));
        }
        Ok(data)
    }
}

#[async_trait]
impl ChatTransport for TelegramApi {
    async fn get_updates(&self, offset: i64, poll_timeout_sec: u64) -> Result<Vec<Update>, GatewayError> {
        let payload = json!({
            "offset": offset,
            "timeout": poll_timeout_sec,
            "allowed_updates": ["message"],
        });
        // Long poll: the HTTP timeout must outlast the poll window.
        let timeout = self.http_timeout_sec.max(poll_timeout_sec + 5);
        let data = self.api("getUpdates", payload, timeout).await?;
        let result = data.get("result").cloned().unwrap_or(Value::Null);
        let Some(items) = result.as_array() else {
            return Ok(Vec::new());
        };
        Ok(items
            .iter()
            .filter_map(|item| serde_json::from_value::<Update>(item.clone()).ok())
            .collect())
    }

    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_markup: Option<&Value>,
    ) -> Result<(), GatewayError> {
        let mut payload = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Some(markup) = reply_markup {
            payload["reply_markup"] = markup.clone();
        }
        self.api("sendMessage", payload, self.http_timeout_sec).await?;
        Ok(())
    }
}

/// Stdout transport for `--dry-run` / simulation: prints what would be sent.
pub struct DryRunTransport;

#[async_trait]
impl ChatTransport for DryRunTransport {
    async fn get_updates(&self, _offset: i64, _poll_timeout_sec: u64) -> Result<Vec<Update>, GatewayError> {
        Ok(Vec::new())
    }

    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_markup: Option<&Value>,
    ) -> Result<(), GatewayError> {
        println!("[DRY-SEND chat_id={}]\n{}\n", chat_id, text);
        if let Some(markup) = reply_markup {
            println!("[DRY-MARKUP chat_id={}] {}", chat_id, markup);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk() {
        assert_eq!(split_text("hello", 3800), vec!["hello"]);
        assert_eq!(split_text("   ", 3800), vec!["(empty)"]);
    }

    #[test]
    fn long_text_splits_on_line_boundaries() {
        let line = "x".repeat(150);
        let text = (0..5).map(|_| line.clone()).collect::<Vec<_>>().join("\n");
        let chunks = split_text(&text, 200);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 200);
        }
        assert_eq!(chunks.join("\n"), text);
    }

    #[test]
    fn oversized_single_line_truncated_with_ellipsis() {
        let line = "y".repeat(500);
        let chunks = split_text(&line, 200);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chars().count(), 200);
        assert!(chunks[0].ends_with("..."));
    }

    #[test]
    fn min_chunk_size_enforced() {
        let text = "a\n".repeat(300);
        for chunk in split_text(&text, 10) {
            assert!(chunk.chars().count() <= 200);
        }
    }

    #[test]
    fn keyboard_carries_core_commands() {
        let kb = build_quick_reply_keyboard();
        let flat = kb.to_string();
        for cmd in ["/status", "/check", "/task", "/monitor", "/kpi", "/help", "/whoami"] {
            assert!(flat.contains(cmd), "keyboard missing {}", cmd);
        }
        assert_eq!(kb["is_persistent"], true);
    }

    #[test]
    fn update_deserializes_with_missing_fields() {
        let u: Update = serde_json::from_value(json!({"update_id": 7})).unwrap();
        assert_eq!(u.update_id, 7);
        assert!(u.message.is_none());

        let u: Update = serde_json::from_value(json!({
            "update_id": 8,
            "message": {"chat": {"id": -10012345678i64}, "text": "/help"},
        }))
        .unwrap();
        let msg = u.message.unwrap();
        assert_eq!(msg.chat.unwrap().id, Some(-10012345678));
        assert_eq!(msg.text.as_deref(), Some("/help"));
    }
}
