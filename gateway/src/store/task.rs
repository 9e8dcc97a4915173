//! Task records: the seven-stage lifecycle shape, short-ids, prompt-derived
//! aliases, bounded history and per-project retention.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::project::ProjectEntry;
use super::{v_bool, v_i64, v_str, v_str_list, RunMode};
use crate::plan::{PlanCritic, ReplanAttempt, TaskPlan};
use crate::util::now_iso;

pub const TASK_HISTORY_LIMIT: usize = 80;
pub const TASK_KEEP_PER_PROJECT: usize = 120;
const LINEAGE_CHILD_LIMIT: usize = 20;

/// The fixed lifecycle phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Intake,
    Planning,
    Staffing,
    Execution,
    Verification,
    Integration,
    Close,
}

pub const LIFECYCLE_STAGES: [Stage; 7] = [
    Stage::Intake,
    Stage::Planning,
    Stage::Staffing,
    Stage::Execution,
    Stage::Verification,
    Stage::Integration,
    Stage::Close,
];

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Planning => "planning",
            Stage::Staffing => "staffing",
            Stage::Execution => "execution",
            Stage::Verification => "verification",
            Stage::Integration => "integration",
            Stage::Close => "close",
        }
    }

    pub fn parse(raw: &str) -> Option<Stage> {
        match raw.trim().to_lowercase().as_str() {
            "intake" => Some(Stage::Intake),
            "planning" => Some(Stage::Planning),
            "staffing" => Some(Stage::Staffing),
            "execution" => Some(Stage::Execution),
            "verification" => Some(Stage::Verification),
            "integration" => Some(Stage::Integration),
            "close" => Some(Stage::Close),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        Ok(Stage::parse(v.as_str().unwrap_or_default()).unwrap_or(Stage::Intake))
    }
}

/// Per-stage status. Deserialization is lenient: aliases like `complete` or
/// `in_progress` normalize, anything unknown becomes `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Done => "done",
            StageStatus::Failed => "failed",
        }
    }

    pub fn normalize(raw: &str) -> StageStatus {
        match raw.trim().to_lowercase().as_str() {
            "running" | "active" | "in_progress" | "progress" => StageStatus::Running,
            "done" | "complete" | "completed" | "success" => StageStatus::Done,
            "failed" | "fail" | "error" => StageStatus::Failed,
            _ => StageStatus::Pending,
        }
    }
}

impl<'de> Deserialize<'de> for StageStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        Ok(StageStatus::normalize(v.as_str().unwrap_or_default()))
    }
}

/// Overall task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn normalize(raw: &str) -> TaskStatus {
        match raw.trim().to_lowercase().as_str() {
            "running" | "active" | "in_progress" | "progress" => TaskStatus::Running,
            "completed" | "done" | "complete" | "success" => TaskStatus::Completed,
            "failed" | "fail" | "error" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        Ok(TaskStatus::normalize(v.as_str().unwrap_or_default()))
    }
}

/// Exactly the seven canonical stage keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageMap {
    pub intake: StageStatus,
    pub planning: StageStatus,
    pub staffing: StageStatus,
    pub execution: StageStatus,
    pub verification: StageStatus,
    pub integration: StageStatus,
    pub close: StageStatus,
}

impl StageMap {
    pub fn get(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::Intake => self.intake,
            Stage::Planning => self.planning,
            Stage::Staffing => self.staffing,
            Stage::Execution => self.execution,
            Stage::Verification => self.verification,
            Stage::Integration => self.integration,
            Stage::Close => self.close,
        }
    }

    pub fn set(&mut self, stage: Stage, status: StageStatus) {
        match stage {
            Stage::Intake => self.intake = status,
            Stage::Planning => self.planning = status,
            Stage::Staffing => self.staffing = status,
            Stage::Execution => self.execution = status,
            Stage::Verification => self.verification = status,
            Stage::Integration => self.integration = status,
            Stage::Close => self.close = status,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub at: String,
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskResult {
    pub assignments: i64,
    pub replies: i64,
    pub complete: bool,
    pub done_roles: Vec<String>,
    pub failed_roles: Vec<String>,
    pub pending_roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub mode: RunMode,
    pub prompt: String,
    pub roles: Vec<String>,
    pub verifier_roles: Vec<String>,
    pub require_verifier: bool,
    pub stages: StageMap,
    pub stage: Stage,
    pub history: Vec<HistoryEvent>,
    pub status: TaskStatus,
    pub created_at: String,
    pub updated_at: String,
    pub result: TaskResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<TaskPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_critic: Option<PlanCritic>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plan_roles: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plan_replans: Vec<ReplanAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_gate_passed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replan_of: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub retry_children: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub replan_children: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub initiator_chat_id: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub canceled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canceled_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canceled_by: Option<String>,
}

impl TaskRecord {
    pub fn new(request_id: &str, mode: RunMode, prompt: &str) -> TaskRecord {
        let now = now_iso();
        TaskRecord {
            request_id: request_id.trim().to_string(),
            short_id: None,
            alias: None,
            mode,
            prompt: prompt.trim().to_string(),
            roles: Vec::new(),
            verifier_roles: Vec::new(),
            require_verifier: false,
            stages: StageMap::default(),
            stage: Stage::Intake,
            history: Vec::new(),
            status: TaskStatus::Running,
            created_at: now.clone(),
            updated_at: now,
            result: TaskResult::default(),
            plan: None,
            plan_critic: None,
            plan_roles: Vec::new(),
            plan_replans: Vec::new(),
            plan_gate_passed: None,
            source_request_id: None,
            control_mode: None,
            retry_of: None,
            replan_of: None,
            retry_children: Vec::new(),
            replan_children: Vec::new(),
            initiator_chat_id: String::new(),
            canceled: false,
            canceled_at: None,
            canceled_by: None,
        }
    }

    /// Appends a request id to a lineage child list, deduplicated and capped.
    pub fn push_child(children: &mut Vec<String>, request_id: &str) {
        let rid = request_id.trim().to_string();
        if rid.is_empty() {
            return;
        }
        if !children.contains(&rid) {
            children.push(rid);
        }
        if children.len() > LINEAGE_CHILD_LIMIT {
            let excess = children.len() - LINEAGE_CHILD_LIMIT;
            children.drain(..excess);
        }
    }
}

pub fn dedupe_roles<I, S>(roles: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    for item in roles {
        let token = item.as_ref().trim().to_string();
        if token.is_empty() {
            continue;
        }
        let key = token.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        out.push(token);
    }
    out
}

/// Lowercases and collapses non-alphanumeric runs into single dashes.
pub fn normalize_task_alias_key(raw: &str) -> String {
    let mut out = String::new();
    let mut sep = false;
    for ch in raw.trim().to_lowercase().chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            sep = false;
        } else if !sep {
            out.push('-');
            sep = true;
        }
    }
    out.trim_matches('-').to_string()
}

pub fn parse_task_seq_from_short_id(short_id: &str) -> u64 {
    let src = short_id.trim().to_uppercase();
    let Some(tail) = src.strip_prefix("T-") else {
        return 0;
    };
    tail.parse::<u64>().unwrap_or(0)
}

pub fn format_task_short_id(seq: u64) -> String {
    let value = seq.max(1);
    if value < 1000 {
        format!("T-{:03}", value)
    } else {
        format!("T-{}", value)
    }
}

/// Slug base from a prompt: strip punctuation, drop filler words (English and
/// Korean), first five tokens joined by dashes, capped at 48 chars.
pub fn derive_task_alias_base(prompt: &str) -> String {
    let src = prompt.trim();
    if src.is_empty() {
        return "task".to_string();
    }

    let cleaned: String = src
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch == ' ' || ch == '-' || ch == '_' {
                ch
            } else {
                ' '
            }
        })
        .collect();
    let tokens: Vec<String> = cleaned.split_whitespace().map(|t| t.to_lowercase()).collect();
    if tokens.is_empty() {
        return "task".to_string();
    }

    const STOP: &[&str] = &[
        "the", "a", "an", "to", "for", "and", "or", "of",
        "해주세요", "해줘", "요청", "작업", "진행", "지금", "바로", "좀",
    ];
    let picked: Vec<&String> = tokens.iter().filter(|t| !STOP.contains(&t.as_str())).collect();
    let picked: Vec<&String> = if picked.is_empty() { tokens.iter().collect() } else { picked };

    let mut alias = picked
        .iter()
        .take(5)
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("-")
        .trim_matches(|c| c == '-' || c == '_')
        .to_string();
    if alias.chars().count() > 48 {
        alias = alias.chars().take(48).collect::<String>();
        alias = alias.trim_end_matches(|c| c == '-' || c == '_').to_string();
    }
    if alias.is_empty() {
        "task".to_string()
    } else {
        alias
    }
}

pub fn task_display_label(task: Option<&TaskRecord>, fallback_request_id: &str) -> String {
    let Some(task) = task else {
        let rid = fallback_request_id.trim();
        return if rid.is_empty() { "-".to_string() } else { rid.to_string() };
    };
    let short_id = task.short_id.as_deref().unwrap_or("").trim().to_uppercase();
    let alias = task.alias.as_deref().unwrap_or("").trim().to_string();
    if !short_id.is_empty() && !alias.is_empty() {
        return format!("{} | {}", short_id, alias);
    }
    if !alias.is_empty() {
        return alias;
    }
    if !short_id.is_empty() {
        return short_id;
    }
    let rid = task.request_id.trim();
    let rid = if rid.is_empty() { fallback_request_id.trim() } else { rid };
    if rid.is_empty() {
        "-".to_string()
    } else {
        rid.to_string()
    }
}

fn sanitize_history(raw: &Value) -> Vec<HistoryEvent> {
    let Some(items) = raw.get("history").and_then(Value::as_array) else {
        return Vec::new();
    };
    let start = items.len().saturating_sub(TASK_HISTORY_LIMIT);
    let mut out = Vec::new();
    for item in &items[start..] {
        if !item.is_object() {
            continue;
        }
        let Some(stage) = Stage::parse(&v_str(item, "stage")) else {
            continue;
        };
        let status = StageStatus::normalize(&v_str(item, "status"));
        let at = {
            let t = v_str(item, "at");
            if t.is_empty() {
                now_iso()
            } else {
                t
            }
        };
        let note = {
            let n = v_str(item, "note");
            if n.is_empty() {
                None
            } else {
                Some(n.chars().take(400).collect())
            }
        };
        out.push(HistoryEvent { at, stage, status, note });
    }
    out
}

/// Rebuilds one task record from an untrusted JSON row, normalizing every
/// field and deriving `stage` from the stage map when the stored value is
/// not a lifecycle stage.
pub fn sanitize_task_record(raw: &Value, req_id: &str) -> TaskRecord {
    let rid = {
        let r = req_id.trim();
        if r.is_empty() {
            v_str(raw, "request_id")
        } else {
            r.to_string()
        }
    };
    let mode = RunMode::parse(&v_str(raw, "mode")).unwrap_or(RunMode::Dispatch);
    let mut task = TaskRecord::new(&rid, mode, &v_str(raw, "prompt"));

    task.roles = dedupe_roles(v_str_list(raw, "roles"));
    task.verifier_roles = dedupe_roles(v_str_list(raw, "verifier_roles"));
    task.require_verifier = v_bool(raw, "require_verifier", false);

    let mut stages = StageMap::default();
    if let Some(raw_stages) = raw.get("stages").filter(|v| v.is_object()) {
        for stage in LIFECYCLE_STAGES {
            stages.set(stage, StageStatus::normalize(&v_str(raw_stages, stage.as_str())));
        }
    }
    task.stages = stages;

    task.stage = match Stage::parse(&v_str(raw, "stage")) {
        Some(stage) => stage,
        None => {
            let mut derived = Stage::Intake;
            for stage in LIFECYCLE_STAGES {
                if stages.get(stage) != StageStatus::Pending {
                    derived = stage;
                }
            }
            derived
        }
    };

    task.history = sanitize_history(raw);
    task.status = TaskStatus::normalize(&v_str(raw, "status"));
    let created = v_str(raw, "created_at");
    if !created.is_empty() {
        task.created_at = created;
    }
    let updated = v_str(raw, "updated_at");
    if !updated.is_empty() {
        task.updated_at = updated;
    }

    if let Some(result) = raw.get("result").filter(|v| v.is_object()) {
        task.result = TaskResult {
            assignments: v_i64(result, "assignments", 0),
            replies: v_i64(result, "replies", 0),
            complete: v_bool(result, "complete", false),
            done_roles: v_str_list(result, "done_roles"),
            failed_roles: v_str_list(result, "failed_roles"),
            pending_roles: v_str_list(result, "pending_roles"),
        };
    }

    let short_id = v_str(raw, "short_id").to_uppercase();
    if !short_id.is_empty() {
        task.short_id = Some(short_id);
    }
    let alias = v_str(raw, "alias");
    if !alias.is_empty() {
        task.alias = Some(alias);
    }

    if let Some(plan) = raw.get("plan").filter(|v| v.is_object()) {
        task.plan = serde_json::from_value(plan.clone()).ok();
    }
    if let Some(critic) = raw.get("plan_critic").filter(|v| v.is_object()) {
        task.plan_critic = serde_json::from_value(critic.clone()).ok();
    }
    task.plan_roles = v_str_list(raw, "plan_roles");
    if let Some(replans) = raw.get("plan_replans").and_then(Value::as_array) {
        task.plan_replans = replans
            .iter()
            .filter_map(|r| serde_json::from_value(r.clone()).ok())
            .collect();
    }
    task.plan_gate_passed = raw.get("plan_gate_passed").and_then(Value::as_bool);

    let source = v_str(raw, "source_request_id");
    if !source.is_empty() {
        task.source_request_id = Some(source);
    }
    let control = v_str(raw, "control_mode");
    if matches!(control.as_str(), "retry" | "replan") {
        task.control_mode = Some(control);
    }
    let retry_of = v_str(raw, "retry_of");
    if !retry_of.is_empty() {
        task.retry_of = Some(retry_of);
    }
    let replan_of = v_str(raw, "replan_of");
    if !replan_of.is_empty() {
        task.replan_of = Some(replan_of);
    }
    task.retry_children = v_str_list(raw, "retry_children");
    task.replan_children = v_str_list(raw, "replan_children");
    task.initiator_chat_id = v_str(raw, "initiator_chat_id");
    task.canceled = v_bool(raw, "canceled", false);
    let canceled_at = v_str(raw, "canceled_at");
    if !canceled_at.is_empty() {
        task.canceled_at = Some(canceled_at);
    }
    let canceled_by = v_str(raw, "canceled_by");
    if !canceled_by.is_empty() {
        task.canceled_by = Some(canceled_by);
    }

    task
}

impl ProjectEntry {
    pub fn task(&self, request_id: &str) -> Option<&TaskRecord> {
        self.tasks.get(request_id.trim())
    }

    /// Looks a task up through the full ref-resolution chain.
    pub fn task_record(&mut self, request_or_alias: &str) -> Option<&TaskRecord> {
        let rid = self.resolve_task_request_id(request_or_alias);
        if rid.is_empty() {
            return None;
        }
        self.tasks.get(&rid)
    }

    /// Assigns `short_id` and `alias` when missing, keeping both unique
    /// within the project (suffix `-2`, `-3`, … on alias collisions).
    pub fn assign_task_alias(&mut self, request_id: &str, prompt: &str, rebuild_index: bool) {
        let req_id = request_id.trim().to_string();
        if req_id.is_empty() || !self.tasks.contains_key(&req_id) {
            return;
        }

        let alias_index = self.task_alias_index.clone();
        let seq = self.task_seq;

        let (mut short_id, mut alias, task_prompt) = {
            let task = &self.tasks[&req_id];
            (
                task.short_id.clone().unwrap_or_default().trim().to_uppercase(),
                task.alias.clone().unwrap_or_default().trim().to_string(),
                task.prompt.clone(),
            )
        };

        if short_id.is_empty() {
            let mut next_seq = seq;
            loop {
                next_seq += 1;
                let candidate = format_task_short_id(next_seq);
                let key = normalize_task_alias_key(&candidate);
                let owner = alias_index.get(&key);
                if owner.is_none() || owner.map(String::as_str) == Some(req_id.as_str()) {
                    short_id = candidate;
                    self.task_seq = next_seq;
                    break;
                }
            }
        }

        if alias.is_empty() {
            let source = if !prompt.trim().is_empty() {
                prompt.to_string()
            } else if !task_prompt.trim().is_empty() {
                task_prompt
            } else {
                short_id.to_lowercase()
            };
            let base = derive_task_alias_base(&source);
            let mut candidate = base.clone();
            let mut suffix = 2u64;
            loop {
                let key = normalize_task_alias_key(&candidate);
                let owner = self.task_alias_index.get(&key);
                if owner.is_none() || owner.map(String::as_str) == Some(req_id.as_str()) {
                    alias = candidate;
                    break;
                }
                candidate = format!("{}-{}", base, suffix);
                suffix += 1;
            }
        }

        if let Some(task) = self.tasks.get_mut(&req_id) {
            task.short_id = Some(short_id);
            task.alias = Some(alias);
        }

        if rebuild_index {
            self.rebuild_task_alias_index();
        } else {
            // keep the in-progress index aware of this task for collision checks
            let task = &self.tasks[&req_id];
            if let Some(sid) = &task.short_id {
                self.task_alias_index.insert(normalize_task_alias_key(sid), req_id.clone());
            }
            if let Some(a) = &task.alias {
                self.task_alias_index.insert(normalize_task_alias_key(a), req_id.clone());
            }
        }
    }

    /// Rebuilds the alias index from the live tasks and advances `task_seq`
    /// to the highest seen short-id.
    pub fn rebuild_task_alias_index(&mut self) {
        let mut index: BTreeMap<String, String> = BTreeMap::new();
        let mut max_seq = self.task_seq;
        for (req_id, task) in &self.tasks {
            if req_id.trim().is_empty() {
                continue;
            }
            if let Some(short_id) = task.short_id.as_deref() {
                let sid = short_id.trim().to_uppercase();
                if !sid.is_empty() {
                    index.insert(normalize_task_alias_key(&sid), req_id.clone());
                    max_seq = max_seq.max(parse_task_seq_from_short_id(&sid));
                }
            }
            if let Some(alias) = task.alias.as_deref() {
                if !alias.trim().is_empty() {
                    index.insert(normalize_task_alias_key(alias), req_id.clone());
                }
            }
        }
        self.task_alias_index = index;
        self.task_seq = max_seq;
    }

    /// Assigns missing short-ids/aliases to every task, oldest first.
    pub fn backfill_task_aliases(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let mut order: Vec<(String, String)> = self
            .tasks
            .iter()
            .map(|(rid, t)| (t.created_at.clone(), rid.clone()))
            .collect();
        order.sort();
        for (_, rid) in order {
            self.assign_task_alias(&rid, "", false);
        }
        self.rebuild_task_alias_index();
    }

    /// Resolves a user ref: exact request id, alias-index key, then a linear
    /// scan by short-id or alias. An unknown token is returned unchanged.
    pub fn resolve_task_request_id(&mut self, request_or_alias: &str) -> String {
        let token = request_or_alias.trim().to_string();
        if token.is_empty() {
            return String::new();
        }
        if self.tasks.contains_key(&token) {
            return token;
        }

        if self.task_alias_index.is_empty() && !self.tasks.is_empty() {
            self.backfill_task_aliases();
        }

        let norm = normalize_task_alias_key(&token);
        if let Some(mapped) = self.task_alias_index.get(&norm) {
            if self.tasks.contains_key(mapped) {
                return mapped.clone();
            }
        }

        // fallback linear scan when index is stale
        for (rid, task) in &self.tasks {
            let short_id = task.short_id.as_deref().unwrap_or("").trim().to_uppercase();
            if token.to_uppercase() == short_id && !short_id.is_empty() {
                return rid.clone();
            }
            let alias = task.alias.as_deref().unwrap_or("");
            if !norm.is_empty() && norm == normalize_task_alias_key(alias) {
                return rid.clone();
            }
        }

        token
    }

    /// Latest request ids ordered by `updated_at` descending.
    pub fn latest_task_request_refs(&mut self, limit: usize) -> Vec<String> {
        if self.tasks.is_empty() {
            return Vec::new();
        }
        self.backfill_task_aliases();
        let mut rows: Vec<(&String, &TaskRecord)> = self.tasks.iter().collect();
        rows.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at));
        let cap = limit.clamp(1, 50);
        rows.iter()
            .take(cap)
            .map(|(rid, _)| (*rid).clone())
            .filter(|rid| !rid.trim().is_empty())
            .collect()
    }

    /// Evicts the oldest tasks by `updated_at` past the retention cap.
    pub fn trim_tasks(&mut self) {
        if self.tasks.len() <= TASK_KEEP_PER_PROJECT {
            return;
        }
        let mut rows: Vec<(String, String)> = self
            .tasks
            .iter()
            .map(|(rid, t)| (t.updated_at.clone(), rid.clone()))
            .collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        let keep: std::collections::BTreeSet<String> = rows
            .iter()
            .take(TASK_KEEP_PER_PROJECT.max(1))
            .map(|(_, rid)| rid.clone())
            .collect();
        self.tasks.retain(|rid, _| keep.contains(rid));
    }

    /// Creates or refreshes a task record for the request, assigning aliases
    /// and re-applying retention.
    #[allow(clippy::too_many_arguments)]
    pub fn ensure_task_record(
        &mut self,
        request_id: &str,
        prompt: &str,
        mode: RunMode,
        roles: &[String],
        verifier_roles: &[String],
        require_verifier: bool,
    ) -> String {
        let token = request_id.trim().to_string();
        let now = now_iso();

        if self.tasks.contains_key(&token) {
            let task = self.tasks.get_mut(&token).expect("checked key");
            if !prompt.trim().is_empty() {
                task.prompt = prompt.trim().to_string();
            }
            task.mode = mode;
            if !roles.is_empty() {
                task.roles = dedupe_roles(roles.iter().map(String::as_str));
            }
            if !verifier_roles.is_empty() {
                task.verifier_roles = dedupe_roles(verifier_roles.iter().map(String::as_str));
            }
            task.require_verifier = require_verifier;
            task.updated_at = now;
        } else {
            let mut task = TaskRecord::new(&token, mode, prompt);
            task.roles = dedupe_roles(roles.iter().map(String::as_str));
            task.verifier_roles = dedupe_roles(verifier_roles.iter().map(String::as_str));
            task.require_verifier = require_verifier;
            self.tasks.insert(token.clone(), task);
        }

        self.assign_task_alias(&token, prompt, false);
        self.trim_tasks();
        self.rebuild_task_alias_index();
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> ProjectEntry {
        ProjectEntry::new("default", "default", "/tmp/p", "/tmp/p/.aoe-team", "")
    }

    #[test]
    fn short_id_formats() {
        assert_eq!(format_task_short_id(1), "T-001");
        assert_eq!(format_task_short_id(42), "T-042");
        assert_eq!(format_task_short_id(1234), "T-1234");
        assert_eq!(parse_task_seq_from_short_id("T-042"), 42);
        assert_eq!(parse_task_seq_from_short_id("t-7"), 7);
        assert_eq!(parse_task_seq_from_short_id("X-1"), 0);
    }

    #[test]
    fn alias_base_drops_stopwords_and_caps_length() {
        assert_eq!(derive_task_alias_base("fix the build for prod"), "fix-build-prod");
        assert_eq!(derive_task_alias_base("로그 정리 작업 해주세요"), "로그-정리");
        assert_eq!(derive_task_alias_base("!!!"), "task");
        let long = "alpha bravo charlie delta echo foxtrot golf";
        assert!(derive_task_alias_base(long).chars().count() <= 48);
    }

    #[test]
    fn alias_key_collapses_punctuation() {
        assert_eq!(normalize_task_alias_key("T-001"), "t-001");
        assert_eq!(normalize_task_alias_key("  Fix__the Build!! "), "fix-the-build");
    }

    #[test]
    fn ensure_task_record_assigns_short_id_and_alias() {
        let mut e = entry();
        e.ensure_task_record("req-1", "fix the build", RunMode::Dispatch, &[], &[], false);
        let task = e.task("req-1").unwrap();
        assert_eq!(task.short_id.as_deref(), Some("T-001"));
        assert_eq!(task.alias.as_deref(), Some("fix-build"));
        assert!(matches!(task.status, TaskStatus::Running));
    }

    #[test]
    fn alias_collision_appends_numeric_suffix() {
        let mut e = entry();
        e.ensure_task_record("req-1", "fix the build", RunMode::Dispatch, &[], &[], false);
        e.ensure_task_record("req-2", "fix the build", RunMode::Dispatch, &[], &[], false);
        assert_eq!(e.task("req-2").unwrap().alias.as_deref(), Some("fix-build-2"));
        assert_eq!(e.task("req-2").unwrap().short_id.as_deref(), Some("T-002"));
    }

    #[test]
    fn resolve_by_exact_alias_short_id_and_fallthrough() {
        let mut e = entry();
        e.ensure_task_record("req-1", "fix the build", RunMode::Dispatch, &[], &[], false);
        assert_eq!(e.resolve_task_request_id("req-1"), "req-1");
        assert_eq!(e.resolve_task_request_id("fix-build"), "req-1");
        assert_eq!(e.resolve_task_request_id("t-001"), "req-1");
        assert_eq!(e.resolve_task_request_id("missing"), "missing");
    }

    #[test]
    fn trim_keeps_most_recently_updated() {
        let mut e = entry();
        for i in 0..(TASK_KEEP_PER_PROJECT + 5) {
            let rid = format!("req-{:04}", i);
            e.ensure_task_record(&rid, "p", RunMode::Dispatch, &[], &[], false);
            if let Some(t) = e.tasks.get_mut(&rid) {
                t.updated_at = format!("2026-01-01T00:{:02}:{:02}+0000", i / 60, i % 60);
            }
        }
        e.trim_tasks();
        assert_eq!(e.tasks.len(), TASK_KEEP_PER_PROJECT);
        assert!(!e.tasks.contains_key("req-0000"));
    }

    #[test]
    fn sanitize_normalizes_aliases_and_bounds_history() {
        let mut history = Vec::new();
        for i in 0..100 {
            history.push(json!({"at": format!("t{}", i), "stage": "execution", "status": "active"}));
        }
        history.push(json!({"at": "x", "stage": "bogus", "status": "done"}));
        let raw = json!({
            "mode": "weird",
            "prompt": " do it ",
            "status": "success",
            "stages": {"execution": "complete", "close": "fail"},
            "stage": "not-a-stage",
            "history": history,
            "roles": ["A", "a", "B"],
        });
        let task = sanitize_task_record(&raw, "req-9");
        assert_eq!(task.request_id, "req-9");
        assert!(matches!(task.mode, RunMode::Dispatch));
        assert!(matches!(task.status, TaskStatus::Completed));
        assert_eq!(task.stages.execution, StageStatus::Done);
        assert_eq!(task.stages.close, StageStatus::Failed);
        // invalid stage field derives from the last non-pending stage
        assert_eq!(task.stage.as_str(), "close");
        assert!(task.history.len() <= TASK_HISTORY_LIMIT);
        assert_eq!(task.roles, vec!["A", "B"]);
    }

    #[test]
    fn display_label_prefers_short_id_and_alias() {
        let mut task = TaskRecord::new("req-1", RunMode::Dispatch, "p");
        assert_eq!(task_display_label(Some(&task), "fb"), "req-1");
        task.short_id = Some("T-001".into());
        assert_eq!(task_display_label(Some(&task), ""), "T-001");
        task.alias = Some("fix-build".into());
        assert_eq!(task_display_label(Some(&task), ""), "T-001 | fix-build");
        assert_eq!(task_display_label(None, "req-2"), "req-2");
        assert_eq!(task_display_label(None, ""), "-");
    }

    #[test]
    fn push_child_dedupes_and_caps() {
        let mut children = Vec::new();
        for i in 0..30 {
            TaskRecord::push_child(&mut children, &format!("req-{}", i));
        }
        TaskRecord::push_child(&mut children, "req-29");
        assert_eq!(children.len(), 20);
        assert_eq!(children.last().map(String::as_str), Some("req-29"));
    }

    #[test]
    fn latest_refs_ordered_by_updated_at() {
        let mut e = entry();
        e.ensure_task_record("req-a", "alpha work", RunMode::Dispatch, &[], &[], false);
        e.ensure_task_record("req-b", "beta work", RunMode::Dispatch, &[], &[], false);
        e.tasks.get_mut("req-a").unwrap().updated_at = "2026-01-02T00:00:00+0000".into();
        e.tasks.get_mut("req-b").unwrap().updated_at = "2026-01-03T00:00:00+0000".into();
        assert_eq!(e.latest_task_request_refs(10), vec!["req-b", "req-a"]);
    }
}
