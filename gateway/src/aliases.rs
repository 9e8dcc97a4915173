//! Chat alias map: every sighted chat id gets a short 1–999 decimal alias.
//! The alias ↔ chat-id mapping is a bijection; invalid rows are dropped on
//! load and the file is written sorted by numeric alias.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::acl::{is_valid_chat_alias, is_valid_chat_id, resolve_role_from_acl_sets, AclSets};
use crate::error::GatewayError;

const MAX_ALIAS: u32 = 999;

/// In-memory alias table plus its backing file. The cache overlays the file
/// so dry-run sessions still see aliases they assigned.
#[derive(Debug, Clone)]
pub struct ChatAliases {
    file: PathBuf,
    cache: BTreeMap<u32, String>,
}

fn read_alias_file(path: &Path) -> BTreeMap<u32, String> {
    let mut out = BTreeMap::new();
    let Ok(content) = std::fs::read_to_string(path) else {
        return out;
    };
    let Ok(data) = serde_json::from_str::<serde_json::Value>(&content) else {
        return out;
    };
    let Some(map) = data.as_object() else {
        return out;
    };

    let mut rows: Vec<(u32, String)> = Vec::new();
    for (key, value) in map {
        let alias = key.trim();
        let chat_id = value.as_str().unwrap_or_default().trim().to_string();
        if !is_valid_chat_alias(alias) || !is_valid_chat_id(&chat_id) {
            continue;
        }
        if let Ok(n) = alias.parse::<u32>() {
            rows.push((n, chat_id));
        }
    }
    rows.sort_by_key(|(n, _)| *n);

    let mut seen: BTreeSet<String> = BTreeSet::new();
    for (alias, chat_id) in rows {
        if seen.contains(&chat_id) {
            continue;
        }
        seen.insert(chat_id.clone());
        out.insert(alias, chat_id);
    }
    out
}

impl ChatAliases {
    pub fn load(file: PathBuf) -> Self {
        let cache = read_alias_file(&file);
        ChatAliases { file, cache }
    }

    /// File rows merged with the in-memory cache; file rows win on alias
    /// conflicts, chat-id uniqueness is preserved.
    pub fn merged(&self) -> BTreeMap<u32, String> {
        let mut rows = read_alias_file(&self.file);
        let mut seen: BTreeSet<String> = rows.values().cloned().collect();
        for (alias, chat_id) in &self.cache {
            if rows.contains_key(alias) || seen.contains(chat_id) {
                continue;
            }
            rows.insert(*alias, chat_id.clone());
            seen.insert(chat_id.clone());
        }
        rows
    }

    pub fn find(&self, chat_id: &str) -> String {
        let cid = chat_id.trim();
        for (alias, mapped) in self.merged() {
            if mapped == cid {
                return alias.to_string();
            }
        }
        String::new()
    }

    fn next_alias(rows: &BTreeMap<u32, String>) -> Option<u32> {
        (1..=MAX_ALIAS).find(|n| !rows.contains_key(n))
    }

    fn save_rows(&self, rows: &BTreeMap<u32, String>) -> std::io::Result<()> {
        let mut sanitized: serde_json::Map<String, serde_json::Value> = serde_json::Map::new();
        let mut seen: BTreeSet<&String> = BTreeSet::new();
        for (alias, chat_id) in rows {
            if !is_valid_chat_id(chat_id) || seen.contains(chat_id) {
                continue;
            }
            seen.insert(chat_id);
            sanitized.insert(alias.to_string(), serde_json::Value::String(chat_id.clone()));
        }
        if let Some(parent) = self.file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.file.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(&serde_json::Value::Object(sanitized))
            .unwrap_or_else(|_| "{}".to_string());
        std::fs::write(&tmp, format!("{}\n", body))?;
        std::fs::rename(&tmp, &self.file)
    }

    /// Assigns (or returns the existing) alias for a chat id. Invalid ids get
    /// no alias. `persist` writes the merged table back to disk.
    pub fn ensure(&mut self, chat_id: &str, persist: bool) -> String {
        let cid = chat_id.trim().to_string();
        if !is_valid_chat_id(&cid) {
            return String::new();
        }
        let mut rows = self.merged();
        if let Some((alias, _)) = rows.iter().find(|(_, mapped)| **mapped == cid) {
            let alias = *alias;
            self.cache = rows;
            return alias.to_string();
        }
        let Some(alias) = Self::next_alias(&rows) else {
            return String::new();
        };
        rows.insert(alias, cid);
        self.cache = rows.clone();
        if persist {
            if let Err(e) = self.save_rows(&rows) {
                tracing::warn!(error = %e, "chat alias save failed");
            }
        }
        alias.to_string()
    }

    /// Assigns aliases for every valid id in the batch, saving once.
    pub fn ensure_many<'a>(&mut self, chat_ids: impl IntoIterator<Item = &'a str>, persist: bool) {
        let mut rows = self.merged();
        let mut changed = false;
        for raw in chat_ids {
            let cid = raw.trim().to_string();
            if !is_valid_chat_id(&cid) || rows.values().any(|m| *m == cid) {
                continue;
            }
            let Some(alias) = Self::next_alias(&rows) else { break };
            rows.insert(alias, cid);
            changed = true;
        }
        self.cache = rows.clone();
        if changed && persist {
            if let Err(e) = self.save_rows(&rows) {
                tracing::warn!(error = %e, "chat alias save failed");
            }
        }
    }

    /// Resolves a user-supplied chat ref (id or alias) to `(chat_id, alias)`.
    pub fn resolve_ref(&mut self, chat_ref: &str, persist: bool) -> Result<(String, String), GatewayError> {
        let token = chat_ref.trim();
        if is_valid_chat_id(token) {
            let alias = self.ensure(token, persist);
            return Ok((token.to_string(), alias));
        }
        if is_valid_chat_alias(token) {
            let rows = self.merged();
            if let Ok(n) = token.parse::<u32>() {
                if let Some(chat_id) = rows.get(&n) {
                    if is_valid_chat_id(chat_id) {
                        return Ok((chat_id.clone(), token.to_string()));
                    }
                }
            }
            return Err(GatewayError::other(format!("unknown chat alias: {} (use /acl)", token)));
        }
        Err(GatewayError::other("chat target must be chat_id or alias"))
    }

    /// `alias:chat_id[role]` rows for `/acl`, capped at `limit`.
    pub fn table_summary(&self, acl: &AclSets, deny_by_default: bool, limit: usize) -> String {
        let rows = self.merged();
        if rows.is_empty() {
            return "(empty)".to_string();
        }
        let mut out: Vec<String> = Vec::new();
        for (alias, chat_id) in rows {
            if !is_valid_chat_id(&chat_id) {
                continue;
            }
            let role = resolve_role_from_acl_sets(&chat_id, acl, deny_by_default);
            out.push(format!("{}:{}[{}]", alias, chat_id, role.as_str()));
            if out.len() >= limit.max(1) {
                break;
            }
        }
        if out.is_empty() {
            "(empty)".to_string()
        } else {
            out.join(", ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aliases_in(dir: &Path) -> ChatAliases {
        ChatAliases::load(dir.join("telegram_chat_aliases.json"))
    }

    #[test]
    fn ensure_assigns_sequential_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = aliases_in(dir.path());
        assert_eq!(a.ensure("111110000", true), "1");
        assert_eq!(a.ensure("222220000", true), "2");
        // re-ensure returns the existing alias
        assert_eq!(a.ensure("111110000", true), "1");
    }

    #[test]
    fn ensure_rejects_invalid_chat_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = aliases_in(dir.path());
        assert_eq!(a.ensure("abc", true), "");
        assert_eq!(a.ensure("1234", true), "");
    }

    #[test]
    fn load_drops_invalid_rows_and_duplicate_chat_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telegram_chat_aliases.json");
        std::fs::write(
            &path,
            r#"{"1": "111110000", "2": "111110000", "bad": "222220000", "3": "junk"}"#,
        )
        .unwrap();
        let a = ChatAliases::load(path);
        let rows = a.merged();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.get(&1).map(String::as_str), Some("111110000"));
    }

    #[test]
    fn persisted_file_round_trips_bijection() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = aliases_in(dir.path());
        a.ensure("111110000", true);
        a.ensure("222220000", true);

        let reloaded = aliases_in(dir.path());
        let rows = reloaded.merged();
        assert_eq!(rows.len(), 2);
        let ids: BTreeSet<&String> = rows.values().collect();
        assert_eq!(ids.len(), 2, "chat ids must stay unique");
    }

    #[test]
    fn resolve_ref_by_alias_and_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = aliases_in(dir.path());
        a.ensure("111110000", true);

        let (cid, alias) = a.resolve_ref("1", true).unwrap();
        assert_eq!(cid, "111110000");
        assert_eq!(alias, "1");

        let (cid, alias) = a.resolve_ref("222220000", true).unwrap();
        assert_eq!(cid, "222220000");
        assert_eq!(alias, "2");
    }

    #[test]
    fn resolve_ref_unknown_alias_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = aliases_in(dir.path());
        let err = a.resolve_ref("7", true).unwrap_err();
        assert!(err.to_string().contains("unknown chat alias"));
        let err = a.resolve_ref("not-a-ref", true).unwrap_err();
        assert!(err.to_string().contains("chat target must be"));
    }

    #[test]
    fn table_summary_includes_roles() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = aliases_in(dir.path());
        a.ensure("111110000", true);
        let mut acl = AclSets::default();
        acl.allow.insert("111110000".into());
        let summary = a.table_summary(&acl, true, 30);
        assert_eq!(summary, "1:111110000[admin]");
    }

    #[test]
    fn dry_run_cache_survives_without_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = aliases_in(dir.path());
        assert_eq!(a.ensure("111110000", false), "1");
        assert_eq!(a.find("111110000"), "1");
        assert!(!dir.path().join("telegram_chat_aliases.json").exists());
    }
}
