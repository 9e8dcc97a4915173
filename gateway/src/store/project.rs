//! Project registry entries: filesystem anchors, overview, task table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::task::TaskRecord;
use crate::util::now_iso;

/// Lowercases and restricts a project name to `[a-z0-9._-]`; everything else
/// becomes `_`, leading/trailing separators are trimmed, empty → `default`.
pub fn normalize_project_name(name: &str) -> String {
    let src = name.trim().to_lowercase();
    let mut out = String::with_capacity(src.len());
    for ch in src.chars() {
        if ch.is_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let token = out.trim_matches(|c| matches!(c, '.' | '_' | '-')).to_string();
    if token.is_empty() {
        "default".to_string()
    } else {
        token
    }
}

/// Containment check for `orch add --path` against the workspace root.
pub fn is_path_within(target: &Path, root: Option<&Path>) -> bool {
    let Some(root) = root else {
        return true;
    };
    let target = match target.canonicalize() {
        Ok(p) => p,
        Err(_) => target.to_path_buf(),
    };
    let root = match root.canonicalize() {
        Ok(p) => p,
        Err(_) => root.to_path_buf(),
    };
    target.starts_with(&root)
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectEntry {
    pub name: String,
    pub display_name: String,
    pub project_root: String,
    pub team_dir: String,
    pub overview: String,
    pub last_request_id: String,
    pub tasks: BTreeMap<String, TaskRecord>,
    pub task_alias_index: BTreeMap<String, String>,
    pub task_seq: u64,
    pub created_at: String,
    pub updated_at: String,
}

impl ProjectEntry {
    pub fn new(name: &str, display_name: &str, project_root: &str, team_dir: &str, overview: &str) -> Self {
        let now = now_iso();
        ProjectEntry {
            name: name.to_string(),
            display_name: {
                let d = display_name.trim();
                if d.is_empty() { name.to_string() } else { d.to_string() }
            },
            project_root: project_root.to_string(),
            team_dir: team_dir.to_string(),
            overview: overview.trim().to_string(),
            last_request_id: String::new(),
            tasks: BTreeMap::new(),
            task_alias_index: BTreeMap::new(),
            task_seq: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn project_root_path(&self) -> PathBuf {
        PathBuf::from(&self.project_root)
    }

    pub fn team_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.team_dir)
    }

    pub fn touch(&mut self) {
        self.updated_at = now_iso();
    }
}
