//! Gateway error taxonomy and user-facing failure replies.
//!
//! Every failed handler maps to one of the closed `E_*` codes; the reply body
//! carries the code on its first line plus a localized message, a masked
//! detail, and a `next:` hint.

use thiserror::Error;

use crate::events::mask_sensitive_text;

pub const ERROR_COMMAND: &str = "E_COMMAND";
pub const ERROR_TIMEOUT: &str = "E_TIMEOUT";
pub const ERROR_GATE: &str = "E_GATE";
pub const ERROR_ORCH: &str = "E_ORCH";
pub const ERROR_REQUEST: &str = "E_REQUEST";
pub const ERROR_TELEGRAM: &str = "E_TELEGRAM";
pub const ERROR_INTERNAL: &str = "E_INTERNAL";
pub const ERROR_AUTH: &str = "E_AUTH";

/// Handler failure. Variants carry the operator-facing message; the code is
/// recovered via [`classify_error`], which also covers untyped messages by
/// substring (usage strings, subprocess stderr).
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Parser/usage/unknown alias failures.
    #[error("{0}")]
    Command(String),

    /// Subprocess exceeded its timeout.
    #[error("{0} timed out after {1}s")]
    Timeout(String, u64),

    /// Telegram API call failed.
    #[error("{0}")]
    Telegram(String),

    /// Anything else; classified by message content.
    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    pub fn usage(msg: impl Into<String>) -> Self {
        GatewayError::Command(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        GatewayError::Other(msg.into())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Other(format!("io error: {}", err))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Other(format!("json error: {}", err))
    }
}

/// Maps an error to `(code, user_message, next_step)`.
///
/// Timeouts are recognized by variant; everything else by lowercase substring
/// match on the display form, mirroring how subprocess and usage errors
/// surface as free text.
pub fn classify_error(err: &GatewayError) -> (&'static str, &'static str, &'static str) {
    if let GatewayError::Timeout(_, _) = err {
        return (
            ERROR_TIMEOUT,
            "요청 처리 시간이 제한을 초과했습니다.",
            "/task 또는 /check로 진행 상태를 확인하세요.",
        );
    }
    if let GatewayError::Telegram(_) = err {
        return (
            ERROR_TELEGRAM,
            "텔레그램 전송 과정에서 오류가 발생했습니다.",
            "잠시 후 같은 명령을 다시 실행하세요.",
        );
    }

    let low = err.to_string().to_lowercase();
    if low.contains("usage:")
        || low.contains("unknown option")
        || low.contains("unknown command")
        || low.contains("invalid cli format")
        || low.contains("invalid priority")
        || low.contains("must be integer")
        || low.contains("unknown orch project")
        || low.contains("unknown chat alias")
        || low.contains("chat target must be")
    {
        return (
            ERROR_COMMAND,
            "명령 형식이 올바르지 않습니다.",
            "/help로 명령 예시를 확인하세요.",
        );
    }
    if low.contains("plan gate blocked") || low.contains("critic") {
        return (
            ERROR_GATE,
            "계획 검증 게이트에서 차단되었습니다.",
            "요청 범위를 좁혀 /dispatch로 다시 실행하세요.",
        );
    }
    if low.contains("verifier gate") {
        return (
            ERROR_GATE,
            "검증 역할(verifier) 요건이 충족되지 않았습니다.",
            "/status로 역할 구성을 확인하세요.",
        );
    }
    if low.contains("permission denied") || low.contains("unauthorized") {
        return (ERROR_AUTH, "권한이 없습니다.", "/whoami로 현재 chat 권한을 확인하세요.");
    }
    if low.contains("aoe-team request failed") || low.contains("request returned non-json") {
        return (
            ERROR_REQUEST,
            "요청 상태를 조회하지 못했습니다.",
            "잠시 후 /check 또는 /task를 다시 실행하세요.",
        );
    }
    if low.contains("telegram api") || low.contains("sendmessage failed") {
        return (
            ERROR_TELEGRAM,
            "텔레그램 전송 과정에서 오류가 발생했습니다.",
            "잠시 후 같은 명령을 다시 실행하세요.",
        );
    }
    if low.contains("aoe-orch run failed") || low.contains("aoe-orch") {
        return (
            ERROR_ORCH,
            "오케스트레이터 실행 중 오류가 발생했습니다.",
            "/status로 시스템 상태를 확인하세요.",
        );
    }
    (
        ERROR_INTERNAL,
        "내부 처리 중 오류가 발생했습니다.",
        "/help 또는 /status로 상태를 확인하세요.",
    )
}

/// Renders the failure reply body: code, message, masked detail (≤180), hint.
pub fn format_error_message(error_code: &str, user_message: &str, next_step: &str, detail: &str) -> String {
    let mut lines = vec![format!("error_code: {}", error_code), user_message.to_string()];
    let masked = mask_sensitive_text(detail.trim());
    if !masked.is_empty() {
        let cut: String = masked.chars().take(180).collect();
        lines.push(format!("detail: {}", cut));
    }
    lines.push(format!("next: {}", next_step));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_classifies_as_command() {
        let err = GatewayError::usage("usage: aoe kpi [hours]");
        assert_eq!(classify_error(&err).0, ERROR_COMMAND);
    }

    #[test]
    fn timeout_variant_classifies_as_timeout() {
        let err = GatewayError::Timeout("aoe-orch run".into(), 600);
        assert_eq!(classify_error(&err).0, ERROR_TIMEOUT);
    }

    #[test]
    fn verifier_gate_message_classifies_as_gate() {
        let err = GatewayError::other("verifier gate enabled but no verifier role is available");
        assert_eq!(classify_error(&err).0, ERROR_GATE);
    }

    #[test]
    fn orch_failure_classifies_as_orch() {
        let err = GatewayError::other("aoe-orch run failed: boom");
        assert_eq!(classify_error(&err).0, ERROR_ORCH);
    }

    #[test]
    fn request_failure_classifies_as_request() {
        let err = GatewayError::other("aoe-team request failed: no such request");
        assert_eq!(classify_error(&err).0, ERROR_REQUEST);
    }

    #[test]
    fn unknown_message_falls_back_to_internal() {
        let err = GatewayError::other("something exploded");
        assert_eq!(classify_error(&err).0, ERROR_INTERNAL);
    }

    #[test]
    fn reply_leads_with_error_code_and_truncates_detail() {
        let detail = "x".repeat(400);
        let body = format_error_message(ERROR_COMMAND, "bad", "use /help", &detail);
        assert!(body.starts_with("error_code: E_COMMAND"));
        assert!(body.contains(&"x".repeat(180)));
        assert!(!body.contains(&"x".repeat(181)));
        assert!(body.ends_with("next: use /help"));
    }
}
