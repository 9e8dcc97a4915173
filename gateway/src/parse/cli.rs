//! CLI-form messages: `aoe …` / `orch …` / `aoe-orch …` with POSIX
//! shell-style token splitting. Usage mistakes surface as command errors.

use super::{normalize_mode_token, ParsedMessage};
use crate::acl::{is_valid_chat_ref, normalize_acl_scope};
use crate::error::GatewayError;

fn usage(msg: &str) -> GatewayError {
    GatewayError::Command(msg.to_string())
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Parses a CLI-form message. `Ok(None)` means the text is not CLI-form at
/// all; malformed CLI-form input is an error.
pub fn parse_cli_message(text: &str) -> Result<Option<ParsedMessage>, GatewayError> {
    let raw = text.trim();
    if raw.is_empty() || raw.starts_with('/') {
        return Ok(None);
    }

    let mut parts = shell_words::split(raw)
        .map_err(|e| GatewayError::Command(format!("invalid CLI format: {}", e)))?;
    if parts.is_empty() {
        return Ok(None);
    }

    let first = parts[0].trim().to_lowercase();
    if matches!(first.as_str(), "aoe" | "orch" | "aoe-orch") {
        parts.remove(0);
    }
    if parts.is_empty() {
        return Ok(Some(ParsedMessage::new("help")));
    }

    let cmd = parts[0].trim().to_lowercase();
    let argv: Vec<String> = parts[1..].to_vec();

    match cmd.as_str() {
        "help" | "status" => Ok(Some(ParsedMessage::new(&cmd))),

        "acl" | "auth" | "permissions" => {
            if !argv.is_empty() {
                return Err(usage("usage: aoe acl"));
            }
            Ok(Some(ParsedMessage::new("acl")))
        }

        "mode" | "inbox" | "on" | "off" => {
            if argv.len() > 1 {
                return Err(usage("usage: aoe mode [on|off|direct|dispatch]"));
            }
            let token = if matches!(cmd.as_str(), "inbox" | "on") && argv.is_empty() {
                "dispatch".to_string()
            } else if cmd == "off" && argv.is_empty() {
                "off".to_string()
            } else {
                argv.first().cloned().unwrap_or_default()
            };
            let normalized = normalize_mode_token(&token);
            if normalized.is_empty() {
                return Err(usage("usage: aoe mode [on|off|direct|dispatch]"));
            }
            let mut out = ParsedMessage::new("mode");
            out.mode = Some(normalized.to_string());
            Ok(Some(out))
        }

        "ok" | "confirm" => {
            if !argv.is_empty() {
                return Err(usage("usage: aoe ok"));
            }
            Ok(Some(ParsedMessage::new("confirm-run")))
        }

        "grant" => {
            if argv.len() != 2 {
                return Err(usage("usage: aoe grant <allow|admin|readonly> <chat_id|alias>"));
            }
            let scope = normalize_acl_scope(&argv[0]);
            let chat_ref = argv[1].trim().to_string();
            if !matches!(scope, "allow" | "admin" | "readonly") || !is_valid_chat_ref(&chat_ref) {
                return Err(usage("usage: aoe grant <allow|admin|readonly> <chat_id|alias>"));
            }
            let mut out = ParsedMessage::new("grant");
            out.scope = Some(scope.to_string());
            out.chat_id = Some(chat_ref);
            Ok(Some(out))
        }

        "revoke" => {
            if argv.len() != 2 {
                return Err(usage("usage: aoe revoke <allow|admin|readonly|all> <chat_id|alias>"));
            }
            let scope = normalize_acl_scope(&argv[0]);
            let chat_ref = argv[1].trim().to_string();
            if scope.is_empty() || !is_valid_chat_ref(&chat_ref) {
                return Err(usage("usage: aoe revoke <allow|admin|readonly|all> <chat_id|alias>"));
            }
            let mut out = ParsedMessage::new("revoke");
            out.scope = Some(scope.to_string());
            out.chat_id = Some(chat_ref);
            Ok(Some(out))
        }

        "kpi" | "metrics" => {
            let mut out = ParsedMessage::new("orch-kpi");
            match argv.len() {
                0 => {}
                1 => {
                    if !is_digits(&argv[0]) {
                        return Err(usage("usage: aoe kpi [hours]"));
                    }
                    out.hours = Some(argv[0].parse::<i64>().unwrap_or(24).clamp(1, 168));
                }
                _ => return Err(usage("usage: aoe kpi [hours]")),
            }
            Ok(Some(out))
        }

        "monitor" | "tasks" | "task-list" => {
            let mut out = ParsedMessage::new("orch-monitor");
            match argv.len() {
                0 => {}
                1 => {
                    if !is_digits(&argv[0]) {
                        return Err(usage("usage: aoe monitor [limit]"));
                    }
                    out.limit = Some(argv[0].parse::<i64>().unwrap_or(12).clamp(1, 50));
                }
                _ => return Err(usage("usage: aoe monitor [limit]")),
            }
            Ok(Some(out))
        }

        "pick" | "select" => {
            if argv.len() != 1 {
                return Err(usage("usage: aoe pick <number|request_or_alias>"));
            }
            let mut out = ParsedMessage::new("orch-pick");
            out.request_id = Some(argv[0].trim().to_string());
            Ok(Some(out))
        }

        "cancel" => match argv.len() {
            0 => Ok(Some(ParsedMessage::new("cancel-pending"))),
            1 => {
                let mut out = ParsedMessage::new("orch-cancel");
                out.request_id = Some(argv[0].trim().to_string());
                Ok(Some(out))
            }
            _ => Err(usage("usage: aoe cancel [<request_or_alias>]")),
        },

        "retry" | "replan" => {
            if argv.len() != 1 {
                return Err(usage(&format!("usage: aoe {} <request_or_alias>", cmd)));
            }
            let mut out = ParsedMessage::new(&format!("orch-{}", cmd));
            out.request_id = Some(argv[0].trim().to_string());
            Ok(Some(out))
        }

        "request" => {
            if argv.len() != 1 {
                return Err(usage("usage: aoe request <request_or_alias>"));
            }
            let mut out = ParsedMessage::new("request");
            out.request_id = Some(argv[0].trim().to_string());
            Ok(Some(out))
        }

        "run" => parse_run_args(&argv).map(Some),

        "add-role" | "addrole" => parse_add_role_args(&argv).map(Some),

        "role" => {
            if argv.is_empty() || argv[0].trim().to_lowercase() != "add" {
                return Err(usage("usage: aoe role add <Role> [options]"));
            }
            parse_add_role_args(&argv[1..]).map(Some)
        }

        "orch" => parse_orch_subcommand(&argv).map(Some),

        _ => Ok(None),
    }
}

fn parse_run_args(argv: &[String]) -> Result<ParsedMessage, GatewayError> {
    const RUN_USAGE: &str = "usage: aoe run [--direct|--dispatch] [--roles <csv>] [--priority P1|P2|P3] [--timeout-sec N] [--no-wait] <prompt>";

    let mut out = ParsedMessage::new("run");
    let mut prompt_tokens: Vec<String> = Vec::new();
    let mut i = 0;
    while i < argv.len() {
        let tok = argv[i].as_str();
        match tok {
            "--" => {
                prompt_tokens.extend(argv[i + 1..].iter().cloned());
                break;
            }
            "--roles" => {
                i += 1;
                let v = argv.get(i).ok_or_else(|| usage("usage: aoe run --roles <csv> <prompt>"))?;
                out.roles = Some(v.trim().to_string());
            }
            "--priority" => {
                i += 1;
                let v = argv
                    .get(i)
                    .ok_or_else(|| usage("usage: aoe run --priority <P1|P2|P3> <prompt>"))?;
                let p = v.trim().to_uppercase();
                if !matches!(p.as_str(), "P1" | "P2" | "P3") {
                    return Err(GatewayError::Command("invalid priority (use P1/P2/P3)".into()));
                }
                out.priority = Some(p);
            }
            "--timeout-sec" => {
                i += 1;
                let v = argv
                    .get(i)
                    .ok_or_else(|| usage("usage: aoe run --timeout-sec <seconds> <prompt>"))?;
                let n: i64 = v
                    .parse()
                    .map_err(|_| GatewayError::Command("--timeout-sec must be an integer".into()))?;
                out.timeout_sec = Some(n.max(1));
            }
            "--no-wait" => out.no_wait = true,
            "--direct" => {
                if out.force_mode.as_deref() == Some("dispatch") {
                    return Err(GatewayError::Command("cannot use --direct with --dispatch".into()));
                }
                out.force_mode = Some("direct".into());
            }
            "--dispatch" => {
                if out.force_mode.as_deref() == Some("direct") {
                    return Err(GatewayError::Command("cannot use --dispatch with --direct".into()));
                }
                out.force_mode = Some("dispatch".into());
            }
            other if other.starts_with("--") => {
                return Err(GatewayError::Command(format!("unknown option: {}", other)));
            }
            _ => {
                prompt_tokens.extend(argv[i..].iter().cloned());
                break;
            }
        }
        i += 1;
    }

    let prompt = prompt_tokens.join(" ").trim().to_string();
    if prompt.is_empty() {
        return Err(usage(RUN_USAGE));
    }
    out.prompt = Some(prompt);
    Ok(out)
}

fn parse_add_role_args(argv: &[String]) -> Result<ParsedMessage, GatewayError> {
    const ADD_ROLE_USAGE: &str =
        "usage: aoe add-role <Role> [--provider <name>] [--launch <cmd>] [--spawn|--no-spawn]";
    if argv.is_empty() {
        return Err(usage(ADD_ROLE_USAGE));
    }

    let mut out = ParsedMessage::new("add-role");
    let mut role = String::new();
    let mut i = 0;
    while i < argv.len() {
        let tok = argv[i].as_str();
        match tok {
            "--provider" => {
                i += 1;
                let v = argv.get(i).ok_or_else(|| usage("usage: --provider <name>"))?;
                out.provider = Some(v.trim().to_string());
            }
            "--launch" => {
                i += 1;
                let v = argv.get(i).ok_or_else(|| usage("usage: --launch <command>"))?;
                out.launch = Some(v.clone());
            }
            "--spawn" => out.spawn = true,
            "--no-spawn" => out.spawn = false,
            other if other.starts_with("--") => {
                return Err(GatewayError::Command(format!("unknown option: {}", other)));
            }
            _ => {
                if !role.is_empty() {
                    return Err(usage("usage: aoe add-role <Role> [options]"));
                }
                role = tok.trim().to_string();
            }
        }
        i += 1;
    }

    if role.is_empty() {
        return Err(usage(ADD_ROLE_USAGE));
    }
    out.role = Some(role);
    Ok(out)
}

/// One `--orch <name>` plus at most one positional; used by the orch
/// subcommands that take a request ref or a project name.
fn parse_orch_named_positional(
    sub_argv: &[String],
    usage_text: &str,
) -> Result<(Option<String>, Option<String>), GatewayError> {
    let mut orch_name: Option<String> = None;
    let mut positional: Option<String> = None;
    let mut i = 0;
    while i < sub_argv.len() {
        let tok = sub_argv[i].as_str();
        if tok == "--orch" {
            i += 1;
            let v = sub_argv.get(i).ok_or_else(|| usage(usage_text))?;
            orch_name = Some(v.trim().to_string());
        } else if tok.starts_with("--") {
            return Err(GatewayError::Command(format!("unknown option: {}", tok)));
        } else {
            if positional.is_some() {
                return Err(usage(usage_text));
            }
            positional = Some(tok.trim().to_string());
        }
        i += 1;
    }
    Ok((orch_name, positional))
}

fn parse_orch_subcommand(argv: &[String]) -> Result<ParsedMessage, GatewayError> {
    if argv.is_empty() {
        return Ok(ParsedMessage::new("orch-help"));
    }

    let sub = argv[0].trim().to_lowercase();
    let sub_argv: Vec<String> = argv[1..].to_vec();

    match sub.as_str() {
        "help" | "h" => Ok(ParsedMessage::new("orch-help")),
        "list" | "ls" => Ok(ParsedMessage::new("orch-list")),

        "use" | "switch" | "select" => {
            if sub_argv.len() != 1 {
                return Err(usage("usage: aoe orch use <name>"));
            }
            let mut out = ParsedMessage::new("orch-use");
            out.orch = Some(sub_argv[0].trim().to_string());
            Ok(out)
        }

        "pick" | "focus" => {
            let text = format!("usage: aoe orch {} [--orch <name>] <number|request_or_alias>", sub);
            let (orch, positional) = parse_orch_named_positional(&sub_argv, &text)?;
            let request_id = positional.filter(|s| !s.is_empty()).ok_or_else(|| usage(&text))?;
            let mut out = ParsedMessage::new("orch-pick");
            out.orch = orch;
            out.request_id = Some(request_id);
            Ok(out)
        }

        "status" | "stat" => {
            let text = "usage: aoe orch status [--orch <name>]";
            let (orch, positional) = parse_orch_named_positional(&sub_argv, text)?;
            let mut out = ParsedMessage::new("orch-status");
            out.orch = orch.or(positional);
            Ok(out)
        }

        "add" | "create" => parse_orch_add(&sub_argv),

        "run" => {
            const ORCH_RUN_USAGE: &str = "usage: aoe orch run [--orch <name>] [--direct|--dispatch] [--roles <csv>] [--priority P1|P2|P3] [--timeout-sec N] [--no-wait] <prompt>";
            let mut orch_name: Option<String> = None;
            let mut passthrough: Vec<String> = Vec::new();
            let mut i = 0;
            while i < sub_argv.len() {
                if sub_argv[i] == "--orch" {
                    i += 1;
                    let v = sub_argv.get(i).ok_or_else(|| usage(ORCH_RUN_USAGE))?;
                    orch_name = Some(v.trim().to_string());
                } else {
                    passthrough.push(sub_argv[i].clone());
                }
                i += 1;
            }
            let mut out = parse_run_args(&passthrough).map_err(|_| usage(ORCH_RUN_USAGE))?;
            out.cmd = "orch-run".into();
            out.orch = orch_name;
            Ok(out)
        }

        "check" | "stage" | "3step" | "3-stage" => {
            let text = "usage: aoe orch check [--orch <name>] [<request_or_alias>]";
            let (orch, positional) = parse_orch_named_positional(&sub_argv, text)?;
            let mut out = ParsedMessage::new("orch-check");
            out.orch = orch;
            out.request_id = positional;
            Ok(out)
        }

        "task" | "lifecycle" | "life" => {
            let text = "usage: aoe orch task [--orch <name>] [<request_or_alias>]";
            let (orch, positional) = parse_orch_named_positional(&sub_argv, text)?;
            let mut out = ParsedMessage::new("orch-task");
            out.orch = orch;
            out.request_id = positional;
            Ok(out)
        }

        "cancel" | "retry" | "replan" => {
            let text = format!("usage: aoe orch {} [--orch <name>] <request_or_alias>", sub);
            let (orch, positional) = parse_orch_named_positional(&sub_argv, &text)?;
            if sub != "cancel" && positional.is_none() {
                return Err(usage(&text));
            }
            let mut out = ParsedMessage::new(&format!("orch-{}", sub));
            out.orch = orch;
            out.request_id = positional;
            Ok(out)
        }

        "monitor" | "tasks" | "board" => {
            let text = "usage: aoe orch monitor [--orch <name>] [--limit <n>]";
            let mut orch_name: Option<String> = None;
            let mut limit: Option<i64> = None;
            let mut i = 0;
            while i < sub_argv.len() {
                let tok = sub_argv[i].as_str();
                if tok == "--orch" {
                    i += 1;
                    let v = sub_argv.get(i).ok_or_else(|| usage(text))?;
                    orch_name = Some(v.trim().to_string());
                } else if tok == "--limit" {
                    i += 1;
                    let v = sub_argv.get(i).ok_or_else(|| usage(text))?;
                    if !is_digits(v) {
                        return Err(GatewayError::Command("--limit must be integer".into()));
                    }
                    limit = Some(v.parse::<i64>().unwrap_or(12).clamp(1, 50));
                } else if tok.starts_with("--") {
                    return Err(GatewayError::Command(format!("unknown option: {}", tok)));
                } else {
                    if !is_digits(tok) {
                        return Err(usage(text));
                    }
                    limit = Some(tok.parse::<i64>().unwrap_or(12).clamp(1, 50));
                }
                i += 1;
            }
            let mut out = ParsedMessage::new("orch-monitor");
            out.orch = orch_name;
            out.limit = limit;
            Ok(out)
        }

        "kpi" | "metrics" => {
            let text = "usage: aoe orch kpi [--orch <name>] [--hours <n>]";
            let mut orch_name: Option<String> = None;
            let mut hours: Option<i64> = None;
            let mut i = 0;
            while i < sub_argv.len() {
                let tok = sub_argv[i].as_str();
                if tok == "--orch" {
                    i += 1;
                    let v = sub_argv.get(i).ok_or_else(|| usage(text))?;
                    orch_name = Some(v.trim().to_string());
                } else if tok == "--hours" {
                    i += 1;
                    let v = sub_argv.get(i).ok_or_else(|| usage(text))?;
                    if !is_digits(v) {
                        return Err(GatewayError::Command("--hours must be integer".into()));
                    }
                    hours = Some(v.parse::<i64>().unwrap_or(24).clamp(1, 168));
                } else if tok.starts_with("--") {
                    return Err(GatewayError::Command(format!("unknown option: {}", tok)));
                } else {
                    if !is_digits(tok) {
                        return Err(usage(text));
                    }
                    hours = Some(tok.parse::<i64>().unwrap_or(24).clamp(1, 168));
                }
                i += 1;
            }
            let mut out = ParsedMessage::new("orch-kpi");
            out.orch = orch_name;
            out.hours = hours;
            Ok(out)
        }

        _ => Err(usage(
            "usage: aoe orch <help|list|use|pick|add|status|run|check|task|cancel|retry|replan|monitor|kpi>",
        )),
    }
}

fn parse_orch_add(sub_argv: &[String]) -> Result<ParsedMessage, GatewayError> {
    const ORCH_ADD_USAGE: &str = "usage: aoe orch add <name> --path <project_root> [--overview <text>] [--init|--no-init] [--spawn|--no-spawn]";

    let mut out = ParsedMessage::new("orch-add");
    let mut orch_name = String::new();
    let mut path = String::new();
    let mut i = 0;
    while i < sub_argv.len() {
        let tok = sub_argv[i].as_str();
        match tok {
            "--path" => {
                i += 1;
                let v = sub_argv.get(i).ok_or_else(|| usage(ORCH_ADD_USAGE))?;
                path = v.trim().to_string();
            }
            "--overview" => {
                i += 1;
                let v = sub_argv.get(i).ok_or_else(|| usage("usage: --overview <text>"))?;
                out.overview = Some(v.clone());
            }
            "--init" => out.init = true,
            "--no-init" => out.init = false,
            "--spawn" => out.spawn = true,
            "--no-spawn" => out.spawn = false,
            "--set-active" => out.set_active = true,
            "--no-set-active" => out.set_active = false,
            other if other.starts_with("--") => {
                return Err(GatewayError::Command(format!("unknown option: {}", other)));
            }
            _ => {
                if !orch_name.is_empty() {
                    return Err(usage("usage: aoe orch add <name> --path <project_root> [options]"));
                }
                orch_name = tok.trim().to_string();
            }
        }
        i += 1;
    }

    if orch_name.is_empty() || path.is_empty() {
        return Err(usage(ORCH_ADD_USAGE));
    }
    out.orch = Some(orch_name);
    out.path = Some(path);
    Ok(out)
}
