//! ACL sets, chat-role resolution and command enforcement policy.
//!
//! `allow` and `admin` are kept distinct in storage and display but are
//! intentionally equivalent at enforcement time.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::GatewayError;

/// Commands a readonly chat may execute.
pub const READONLY_ALLOWED_COMMANDS: &[&str] = &[
    "start",
    "help",
    "orch-help",
    "mode",
    "whoami",
    "acl",
    "status",
    "orch-status",
    "request",
    "orch-list",
    "orch-monitor",
    "orch-kpi",
    "orch-check",
    "orch-task",
    "orch-pick",
    "cancel-pending",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    Owner,
    Admin,
    Readonly,
    Unknown,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::Owner => "owner",
            ChatRole::Admin => "admin",
            ChatRole::Readonly => "readonly",
            ChatRole::Unknown => "unknown",
        }
    }
}

/// The three ACL sets plus the optional owner id. Mutations go through
/// methods that re-apply the `readonly ∩ (admin ∪ allow) = ∅` invariant.
#[derive(Debug, Clone, Default)]
pub struct AclSets {
    pub allow: BTreeSet<String>,
    pub admin: BTreeSet<String>,
    pub readonly: BTreeSet<String>,
    pub owner_chat_id: String,
}

impl AclSets {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.admin.is_empty() && self.readonly.is_empty()
    }

    /// Drops readonly entries that are also in admin or allow.
    pub fn enforce_disjoint(&mut self) {
        let admin = self.admin.clone();
        let allow = self.allow.clone();
        self.readonly.retain(|x| !admin.contains(x) && !allow.contains(x));
    }

    pub fn grant(&mut self, scope: &str, chat_id: &str) {
        let cid = chat_id.trim().to_string();
        match scope {
            "allow" => {
                self.allow.insert(cid.clone());
                self.readonly.remove(&cid);
            }
            "admin" => {
                self.admin.insert(cid.clone());
                self.readonly.remove(&cid);
            }
            "readonly" => {
                self.readonly.insert(cid.clone());
                self.allow.remove(&cid);
                self.admin.remove(&cid);
            }
            _ => {}
        }
        self.enforce_disjoint();
    }

    pub fn revoke(&mut self, scope: &str, chat_id: &str) {
        let cid = chat_id.trim();
        if matches!(scope, "allow" | "all") {
            self.allow.remove(cid);
        }
        if matches!(scope, "admin" | "all") {
            self.admin.remove(cid);
        }
        if matches!(scope, "readonly" | "all") {
            self.readonly.remove(cid);
        }
        self.enforce_disjoint();
    }

    /// `/lockme`: collapse access to a single chat which becomes the owner.
    pub fn lock_to(&mut self, chat_id: &str) {
        self.allow = BTreeSet::from([chat_id.trim().to_string()]);
        self.admin.clear();
        self.readonly.clear();
        self.owner_chat_id = chat_id.trim().to_string();
    }
}

pub fn parse_csv_set(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn format_csv_set(values: &BTreeSet<String>) -> String {
    values
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Scope aliases for grant/revoke; unknown scopes map to the empty string.
pub fn normalize_acl_scope(raw: &str) -> &'static str {
    match raw.trim().to_lowercase().as_str() {
        "allow" | "allowed" => "allow",
        "admin" | "owner" => "admin",
        "readonly" | "read" | "ro" => "readonly",
        "all" => "all",
        _ => "",
    }
}

static CHAT_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d{5,20}$").expect("chat id pattern"));
static CHAT_ALIAS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[1-9]\d{0,2}$").expect("alias pattern"));

pub fn is_valid_chat_id(raw: &str) -> bool {
    CHAT_ID_RE.is_match(raw.trim())
}

pub fn is_valid_chat_alias(raw: &str) -> bool {
    CHAT_ALIAS_RE.is_match(raw.trim())
}

pub fn is_valid_chat_ref(raw: &str) -> bool {
    is_valid_chat_id(raw) || is_valid_chat_alias(raw)
}

pub fn normalize_owner_chat_id(raw: &str) -> String {
    let token = raw.trim();
    if is_valid_chat_id(token) {
        token.to_string()
    } else {
        String::new()
    }
}

/// Splits slash-form `/grant` arguments; "all" is rejected for grants.
pub fn parse_acl_command_args(rest: &str, usage: &str) -> Result<(String, String), GatewayError> {
    let (scope, chat_ref) = split_acl_args(rest, usage)?;
    if scope.is_empty() || scope == "all" {
        return Err(GatewayError::Command(usage.to_string()));
    }
    Ok((scope, chat_ref))
}

/// Splits slash-form `/revoke` arguments; "all" is accepted.
pub fn parse_acl_revoke_args(rest: &str, usage: &str) -> Result<(String, String), GatewayError> {
    let (scope, chat_ref) = split_acl_args(rest, usage)?;
    if scope.is_empty() {
        return Err(GatewayError::Command(usage.to_string()));
    }
    Ok((scope, chat_ref))
}

fn split_acl_args(rest: &str, usage: &str) -> Result<(String, String), GatewayError> {
    let text = rest.trim();
    let parts = if text.is_empty() {
        Vec::new()
    } else {
        shell_words::split(text).map_err(|e| GatewayError::Command(format!("{} ({})", usage, e)))?
    };
    if parts.len() != 2 {
        return Err(GatewayError::Command(usage.to_string()));
    }
    let scope = normalize_acl_scope(&parts[0]).to_string();
    let chat_ref = parts[1].trim().to_string();
    if !is_valid_chat_ref(&chat_ref) {
        return Err(GatewayError::Command(format!(
            "{} (chat target must be chat_id or alias)",
            usage
        )));
    }
    Ok((scope, chat_ref))
}

/// Pure role resolution; `allow` membership resolves to admin. An entirely
/// empty ACL grants admin unless deny-by-default is on.
pub fn resolve_role_from_acl_sets(chat_id: &str, acl: &AclSets, deny_by_default: bool) -> ChatRole {
    let cid = chat_id.trim();
    if cid.is_empty() {
        return ChatRole::Unknown;
    }
    if acl.admin.contains(cid) {
        return ChatRole::Admin;
    }
    if acl.readonly.contains(cid) {
        return ChatRole::Readonly;
    }
    if acl.allow.contains(cid) {
        return ChatRole::Admin;
    }
    if acl.is_empty() && !deny_by_default {
        return ChatRole::Admin;
    }
    ChatRole::Unknown
}

/// Resolves the full role including the owner gate.
pub fn resolve_chat_role(chat_id: &str, acl: &AclSets, deny_by_default: bool) -> ChatRole {
    let owner = normalize_owner_chat_id(&acl.owner_chat_id);
    if !owner.is_empty() && chat_id.trim() == owner {
        return ChatRole::Owner;
    }
    resolve_role_from_acl_sets(chat_id, acl, deny_by_default)
}

/// Poller-level admission: owner always passes; a non-empty ACL requires
/// membership; an empty ACL admits everyone unless deny-by-default.
pub fn ensure_chat_allowed(chat_id: &str, acl: &AclSets, deny_by_default: bool) -> bool {
    let owner = normalize_owner_chat_id(&acl.owner_chat_id);
    if !owner.is_empty() && chat_id.trim() == owner {
        return true;
    }
    if acl.is_empty() {
        return !deny_by_default;
    }
    let cid = chat_id.trim();
    acl.allow.contains(cid) || acl.admin.contains(cid) || acl.readonly.contains(cid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl(allow: &[&str], admin: &[&str], readonly: &[&str], owner: &str) -> AclSets {
        AclSets {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            admin: admin.iter().map(|s| s.to_string()).collect(),
            readonly: readonly.iter().map(|s| s.to_string()).collect(),
            owner_chat_id: owner.to_string(),
        }
    }

    #[test]
    fn chat_id_and_alias_validation() {
        assert!(is_valid_chat_id("12345"));
        assert!(is_valid_chat_id("-10012345678"));
        assert!(!is_valid_chat_id("1234"));
        assert!(!is_valid_chat_id("abc"));
        assert!(is_valid_chat_alias("1"));
        assert!(is_valid_chat_alias("999"));
        assert!(!is_valid_chat_alias("0"));
        assert!(!is_valid_chat_alias("1000"));
    }

    #[test]
    fn scope_aliases() {
        assert_eq!(normalize_acl_scope("allowed"), "allow");
        assert_eq!(normalize_acl_scope("OWNER"), "admin");
        assert_eq!(normalize_acl_scope("ro"), "readonly");
        assert_eq!(normalize_acl_scope("all"), "all");
        assert_eq!(normalize_acl_scope("nope"), "");
    }

    #[test]
    fn allow_membership_resolves_to_admin() {
        let a = acl(&["11111"], &[], &[], "");
        assert_eq!(resolve_role_from_acl_sets("11111", &a, true), ChatRole::Admin);
    }

    #[test]
    fn admin_wins_over_readonly() {
        let a = acl(&[], &["11111"], &["11111"], "");
        assert_eq!(resolve_role_from_acl_sets("11111", &a, true), ChatRole::Admin);
    }

    #[test]
    fn empty_acl_open_mode_grants_admin() {
        let a = acl(&[], &[], &[], "");
        assert_eq!(resolve_role_from_acl_sets("22222", &a, false), ChatRole::Admin);
        assert_eq!(resolve_role_from_acl_sets("22222", &a, true), ChatRole::Unknown);
    }

    #[test]
    fn owner_wins_everything() {
        let a = acl(&[], &[], &["99999"], "99999");
        assert_eq!(resolve_chat_role("99999", &a, true), ChatRole::Owner);
    }

    #[test]
    fn ensure_chat_allowed_rules() {
        let a = acl(&["11111"], &[], &[], "");
        assert!(ensure_chat_allowed("11111", &a, true));
        assert!(!ensure_chat_allowed("22222", &a, true));

        let empty = acl(&[], &[], &[], "");
        assert!(ensure_chat_allowed("22222", &empty, false));
        assert!(!ensure_chat_allowed("22222", &empty, true));

        let owned = acl(&[], &[], &[], "33333");
        assert!(ensure_chat_allowed("33333", &owned, true));
    }

    #[test]
    fn grant_readonly_removes_other_scopes() {
        let mut a = acl(&["11111"], &["11111"], &[], "");
        a.grant("readonly", "11111");
        assert!(a.readonly.contains("11111"));
        assert!(!a.allow.contains("11111"));
        assert!(!a.admin.contains("11111"));
    }

    #[test]
    fn disjoint_invariant_holds_after_grant() {
        let mut a = acl(&[], &[], &["11111"], "");
        a.grant("admin", "11111");
        assert!(!a.readonly.contains("11111"));
        assert!(a.admin.contains("11111"));
    }

    #[test]
    fn revoke_all_clears_every_scope() {
        let mut a = acl(&["11111"], &["11111"], &[], "");
        a.revoke("all", "11111");
        assert!(a.is_empty());
    }

    #[test]
    fn lock_to_sets_single_owner() {
        let mut a = acl(&["11111", "22222"], &["33333"], &["44444"], "");
        a.lock_to("55555");
        assert_eq!(a.allow.len(), 1);
        assert!(a.allow.contains("55555"));
        assert!(a.admin.is_empty());
        assert!(a.readonly.is_empty());
        assert_eq!(a.owner_chat_id, "55555");
    }

    #[test]
    fn grant_args_reject_all_scope() {
        assert!(parse_acl_command_args("all 12345", "usage: x").is_err());
        let (scope, chat_ref) = parse_acl_command_args("admin 12345", "usage: x").unwrap();
        assert_eq!(scope, "admin");
        assert_eq!(chat_ref, "12345");
    }

    #[test]
    fn revoke_args_accept_all_scope() {
        let (scope, _) = parse_acl_revoke_args("all 12345", "usage: x").unwrap();
        assert_eq!(scope, "all");
    }

    #[test]
    fn acl_args_validate_chat_ref() {
        let err = parse_acl_command_args("admin bogus", "usage: x").unwrap_err();
        assert!(err.to_string().contains("chat target must be"));
    }

    #[test]
    fn csv_round_trip() {
        let set = parse_csv_set("b, a ,,c");
        assert_eq!(format_csv_set(&set), "a,b,c");
    }
}
