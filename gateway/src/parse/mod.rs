//! Input parsing: slash commands, natural-language quick forms, and the
//! `aoe …` CLI form, normalized into a loose [`ParsedMessage`] that the
//! resolver turns into a typed command.

mod cli;
mod quick;
mod risk;

pub use cli::parse_cli_message;
pub use quick::parse_quick_message;
pub use risk::detect_high_risk_prompt;

/// Loosely-typed parse result shared by the quick and CLI parsers. The `cmd`
/// key uses the gateway's canonical command names (`run`, `orch-check`, …).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub cmd: String,
    pub mode: Option<String>,
    pub hours: Option<i64>,
    pub limit: Option<i64>,
    pub request_id: Option<String>,
    pub prompt: Option<String>,
    pub force_mode: Option<String>,
    pub roles: Option<String>,
    pub priority: Option<String>,
    pub timeout_sec: Option<i64>,
    pub no_wait: bool,
    pub orch: Option<String>,
    pub scope: Option<String>,
    pub chat_id: Option<String>,
    pub role: Option<String>,
    pub provider: Option<String>,
    pub launch: Option<String>,
    pub spawn: bool,
    pub path: Option<String>,
    pub overview: Option<String>,
    pub init: bool,
    pub set_active: bool,
}

impl ParsedMessage {
    pub fn new(cmd: &str) -> Self {
        ParsedMessage {
            cmd: cmd.to_string(),
            mode: None,
            hours: None,
            limit: None,
            request_id: None,
            prompt: None,
            force_mode: None,
            roles: None,
            priority: None,
            timeout_sec: None,
            no_wait: false,
            orch: None,
            scope: None,
            chat_id: None,
            role: None,
            provider: None,
            launch: None,
            spawn: true,
            path: None,
            overview: None,
            init: true,
            set_active: true,
        }
    }
}

/// Splits a slash message into `(command, rest)`. The command head is
/// lowercased with any `@bot` suffix stripped; non-slash text returns an
/// empty command with the full text as rest.
pub fn parse_command(text: &str) -> (String, String) {
    let text = text.trim();
    if !text.starts_with('/') {
        return (String::new(), text.to_string());
    }
    let (first, rest) = match text.split_once(' ') {
        Some((f, r)) => (f, r),
        None => (text, ""),
    };
    let mut token = &first[1..];
    if let Some((head, _)) = token.split_once('@') {
        token = head;
    }
    (token.trim().to_lowercase(), rest.trim().to_string())
}

/// Normalizes a routing-mode token to one of `status|dispatch|direct|off`;
/// unknown tokens return the empty string.
pub fn normalize_mode_token(raw: &str) -> &'static str {
    match raw.trim().to_lowercase().as_str() {
        "" | "status" | "show" | "current" | "now" | "확인" | "현재" => "status",
        "dispatch" | "team" | "task" | "작업" | "팀작업" | "on" | "enable" | "enabled" | "start"
        | "켜기" | "활성화" => "dispatch",
        "direct" | "ask" | "question" | "질문" | "직접" => "direct",
        "off" | "none" | "disable" | "clear" | "stop" | "해제" | "끄기" => "off",
        _ => "",
    }
}

/// Collapses internal whitespace runs and trims.
pub fn normalize_loose_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_slash_with_rest() {
        assert_eq!(parse_command("/dispatch do the thing"), ("dispatch".into(), "do the thing".into()));
    }

    #[test]
    fn parse_command_strips_bot_suffix_and_lowercases() {
        assert_eq!(parse_command("/Help@MyBot"), ("help".into(), String::new()));
    }

    #[test]
    fn parse_command_plain_text_has_empty_cmd() {
        assert_eq!(parse_command("  hello there  "), (String::new(), "hello there".into()));
    }

    #[test]
    fn normalize_mode_token_table() {
        assert_eq!(normalize_mode_token("on"), "dispatch");
        assert_eq!(normalize_mode_token("enable"), "dispatch");
        assert_eq!(normalize_mode_token("team"), "dispatch");
        assert_eq!(normalize_mode_token("ask"), "direct");
        assert_eq!(normalize_mode_token("질문"), "direct");
        assert_eq!(normalize_mode_token("clear"), "off");
        assert_eq!(normalize_mode_token("stop"), "off");
        assert_eq!(normalize_mode_token(""), "status");
        assert_eq!(normalize_mode_token("weird"), "");
    }

    #[test]
    fn normalize_loose_text_collapses_whitespace() {
        assert_eq!(normalize_loose_text("  a \t b\n c "), "a b c");
    }
}
