//! Natural-language quick forms: a bilingual keyword table mapping short
//! phrases to commands, with optional request-id / numeric tails.

use super::{normalize_loose_text, normalize_mode_token, ParsedMessage};

fn with_request_id(cmd: &str, tail: &str) -> ParsedMessage {
    let mut out = ParsedMessage::new(cmd);
    out.request_id = Some(tail.trim().to_string());
    out
}

fn tail_after_first_word(norm: &str) -> String {
    norm.split_once(' ').map(|(_, t)| t.trim().to_string()).unwrap_or_default()
}

/// Parses a non-slash message against the quick keyword table. Returns `None`
/// when nothing matches (the CLI parser runs next).
pub fn parse_quick_message(text: &str) -> Option<ParsedMessage> {
    let norm = normalize_loose_text(text);
    if norm.is_empty() || norm.starts_with('/') {
        return None;
    }
    let low = norm.to_lowercase();

    if matches!(low.as_str(), "help" | "도움말" | "메뉴" | "menu") {
        return Some(ParsedMessage::new("help"));
    }
    if matches!(low.as_str(), "ok" | "확인실행" | "실행확인") {
        return Some(ParsedMessage::new("confirm-run"));
    }

    if matches!(low.as_str(), "mode" | "모드") {
        let mut out = ParsedMessage::new("mode");
        out.mode = Some("status".into());
        return Some(out);
    }
    if matches!(low.as_str(), "inbox" | "on" | "켜기" | "활성화") {
        let mut out = ParsedMessage::new("mode");
        out.mode = Some("dispatch".into());
        return Some(out);
    }
    if matches!(low.as_str(), "off" | "끄기" | "해제") {
        let mut out = ParsedMessage::new("mode");
        out.mode = Some("off".into());
        return Some(out);
    }
    if low.starts_with("mode ") || low.starts_with("모드 ") {
        let token = normalize_mode_token(&tail_after_first_word(&norm));
        let mut out = ParsedMessage::new("mode");
        out.mode = Some(if token.is_empty() { "invalid".into() } else { token.into() });
        return Some(out);
    }

    if matches!(low.as_str(), "acl" | "권한" | "권한설정" | "permissions" | "permission") {
        return Some(ParsedMessage::new("acl"));
    }
    if matches!(low.as_str(), "status" | "상태" | "현재 상태" | "현재상태") {
        return Some(ParsedMessage::new("status"));
    }

    if matches!(low.as_str(), "kpi" | "지표" | "메트릭" | "metrics") {
        return Some(ParsedMessage::new("orch-kpi"));
    }
    if low.starts_with("kpi ") {
        let tail = tail_after_first_word(&norm);
        let mut out = ParsedMessage::new("orch-kpi");
        if let Ok(n) = tail.parse::<i64>() {
            if tail.chars().all(|c| c.is_ascii_digit()) {
                out.hours = Some(n.clamp(1, 168));
            }
        }
        return Some(out);
    }

    if matches!(low.as_str(), "모니터" | "작업목록" | "목록" | "monitor" | "tasks") {
        return Some(ParsedMessage::new("orch-monitor"));
    }
    if low.starts_with("모니터 ") || low.starts_with("작업목록 ") {
        let tail = tail_after_first_word(&norm);
        let mut out = ParsedMessage::new("orch-monitor");
        if tail.chars().all(|c| c.is_ascii_digit()) && !tail.is_empty() {
            if let Ok(n) = tail.parse::<i64>() {
                out.limit = Some(n.clamp(1, 50));
            }
        }
        return Some(out);
    }

    if matches!(low.as_str(), "진행" | "진행 확인" | "진행확인" | "check") {
        return Some(ParsedMessage::new("orch-check"));
    }
    for prefix in ["진행 ", "check ", "확인 "] {
        if low.starts_with(prefix) {
            return Some(with_request_id("orch-check", &tail_after_first_word(&norm)));
        }
    }

    if matches!(low.as_str(), "상세" | "상세 상태" | "상세상태" | "task" | "lifecycle" | "라이프사이클") {
        return Some(ParsedMessage::new("orch-task"));
    }
    for prefix in ["상세 ", "task ", "상태 "] {
        if low.starts_with(prefix) {
            return Some(with_request_id("orch-task", &tail_after_first_word(&norm)));
        }
    }

    if matches!(low.as_str(), "pick" | "선택") {
        return Some(ParsedMessage::new("orch-pick"));
    }
    for prefix in ["pick ", "선택 "] {
        if low.starts_with(prefix) {
            return Some(with_request_id("orch-pick", &tail_after_first_word(&norm)));
        }
    }

    for prefix in ["retry ", "재시도 ", "다시 "] {
        if low.starts_with(prefix) {
            return Some(with_request_id("orch-retry", &tail_after_first_word(&norm)));
        }
    }
    for prefix in ["replan ", "재계획 "] {
        if low.starts_with(prefix) {
            return Some(with_request_id("orch-replan", &tail_after_first_word(&norm)));
        }
    }
    for prefix in ["cancel ", "취소 "] {
        if low.starts_with(prefix) {
            return Some(with_request_id("orch-cancel", &tail_after_first_word(&norm)));
        }
    }

    if matches!(low.as_str(), "취소" | "cancel" | "취소해") {
        return Some(ParsedMessage::new("cancel-pending"));
    }

    if matches!(low.as_str(), "팀작업" | "작업" | "dispatch") {
        return Some(ParsedMessage::new("quick-dispatch"));
    }
    if matches!(low.as_str(), "직접질문" | "직접" | "질문" | "direct") {
        return Some(ParsedMessage::new("quick-direct"));
    }

    let dispatch_prefixes = ["팀작업:", "팀작업 ", "작업:", "작업 ", "dispatch:", "dispatch "];
    for prefix in dispatch_prefixes {
        if low.starts_with(prefix) {
            let prompt = norm[prefix.len()..].trim().to_string();
            if prompt.is_empty() {
                return Some(ParsedMessage::new("quick-dispatch"));
            }
            let mut out = ParsedMessage::new("run");
            out.prompt = Some(prompt);
            out.force_mode = Some("dispatch".into());
            return Some(out);
        }
    }

    let direct_prefixes = ["질문:", "질문 ", "직접:", "직접 ", "direct:", "direct "];
    for prefix in direct_prefixes {
        if low.starts_with(prefix) {
            let prompt = norm[prefix.len()..].trim().to_string();
            if prompt.is_empty() {
                return Some(ParsedMessage::new("quick-direct"));
            }
            let mut out = ParsedMessage::new("run");
            out.prompt = Some(prompt);
            out.force_mode = Some("direct".into());
            return Some(out);
        }
    }

    None
}
