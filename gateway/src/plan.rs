//! Dispatch planner: planner → critic → repair loop, with a deterministic
//! single-subtask fallback so planning failures never block the pipeline
//! unless the operator enabled the gate.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::llm::LlmClient;
use crate::store::dedupe_roles;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSubtask {
    pub id: String,
    pub title: String,
    pub goal: String,
    pub owner_role: String,
    pub acceptance: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanMeta {
    pub max_subtasks: usize,
    pub worker_roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub summary: String,
    pub subtasks: Vec<PlanSubtask>,
    pub meta: PlanMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCritic {
    pub approved: bool,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl Default for PlanCritic {
    fn default() -> Self {
        PlanCritic {
            approved: true,
            issues: Vec::new(),
            recommendations: Vec::new(),
        }
    }
}

/// One auto-replan attempt row kept on the task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanAttempt {
    pub attempt: u32,
    pub critic: String,
    pub subtasks: usize,
}

/// A critic blocks when it disapproves or reports any issue.
pub fn critic_has_blockers(critic: &PlanCritic) -> bool {
    !critic.approved || !critic.issues.is_empty()
}

/// Best-effort extraction of the first balanced JSON object in free text.
pub fn parse_json_object_from_text(text: &str) -> Option<Value> {
    let src = text.trim();
    if src.is_empty() {
        return None;
    }

    if let Ok(obj) = serde_json::from_str::<Value>(src) {
        if obj.is_object() {
            return Some(obj);
        }
    }

    for (i, ch) in src.char_indices() {
        if ch != '{' {
            continue;
        }
        let mut de = serde_json::Deserializer::from_str(&src[i..]).into_iter::<Value>();
        if let Some(Ok(obj)) = de.next() {
            if obj.is_object() {
                return Some(obj);
            }
        }
    }
    None
}

/// Normalizes raw planner output into a valid plan: ids `S<i>`, owner roles
/// restricted to the worker set, 1–3 acceptance lines, subtask cap, and a
/// single-subtask fallback rooted in the user prompt.
pub fn normalize_task_plan_payload(
    parsed: Option<&Value>,
    user_prompt: &str,
    workers: &[String],
    max_subtasks: usize,
) -> TaskPlan {
    let limit = max_subtasks.max(1);
    let mut summary = String::new();
    let mut normalized: Vec<PlanSubtask> = Vec::new();

    if let Some(parsed) = parsed.filter(|v| v.is_object()) {
        summary = parsed
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if let Some(rows) = parsed.get("subtasks").and_then(Value::as_array) {
            for (i, row) in rows.iter().enumerate() {
                if !row.is_object() {
                    continue;
                }
                let idx = i + 1;
                let sid = {
                    let s = row.get("id").and_then(Value::as_str).unwrap_or_default().trim().to_string();
                    if s.is_empty() {
                        format!("S{}", idx)
                    } else {
                        s
                    }
                };
                let title = {
                    let t = row.get("title").and_then(Value::as_str).unwrap_or_default().trim().to_string();
                    if !t.is_empty() {
                        t
                    } else {
                        let g = row.get("goal").and_then(Value::as_str).unwrap_or_default().trim().to_string();
                        if g.is_empty() {
                            format!("Subtask {}", idx)
                        } else {
                            g
                        }
                    }
                };
                let goal = {
                    let g = row.get("goal").and_then(Value::as_str).unwrap_or_default().trim().to_string();
                    if g.is_empty() {
                        title.clone()
                    } else {
                        g
                    }
                };
                let role_raw = row
                    .get("owner_role")
                    .or_else(|| row.get("role"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_lowercase();
                let owner_role = workers
                    .iter()
                    .find(|w| w.to_lowercase() == role_raw)
                    .cloned()
                    .unwrap_or_else(|| workers[(idx - 1).min(workers.len().saturating_sub(1))].clone());

                let mut acceptance: Vec<String> = row
                    .get("acceptance")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                if acceptance.is_empty() {
                    acceptance = vec![format!("{} 결과가 사용자 요청과 직접 연결되어 설명된다.", title)];
                }
                acceptance.truncate(3);

                normalized.push(PlanSubtask {
                    id: sid,
                    title,
                    goal,
                    owner_role,
                    acceptance,
                });
            }
        }
    }

    normalized.truncate(limit);

    if normalized.is_empty() {
        normalized.push(PlanSubtask {
            id: "S1".to_string(),
            title: "요청 핵심 실행".to_string(),
            goal: user_prompt.trim().to_string(),
            owner_role: workers.first().cloned().unwrap_or_else(|| "Reviewer".to_string()),
            acceptance: vec!["요청에 대한 실행/검증 결과가 사용자 관점으로 정리된다.".to_string()],
        });
    }

    if summary.is_empty() {
        summary = format!("subtasks={}", normalized.len());
    }

    TaskPlan {
        summary,
        subtasks: normalized,
        meta: PlanMeta {
            max_subtasks: limit,
            worker_roles: workers.to_vec(),
        },
    }
}

fn planner_prompt(user_prompt: &str, workers: &[String], max_subtasks: usize) -> String {
    format!(
        "너는 작업 오케스트레이션 planner다. 사용자 요청을 실행 가능한 sub-task 계획으로 분해해라.\n\
         반드시 JSON 객체만 출력한다. 설명 문장 금지.\n\
         JSON 스키마:\n\
         {{\n  \"summary\": \"한 줄 요약\",\n  \"subtasks\": [\n    {{\"id\":\"S1\", \"title\":\"...\", \"goal\":\"...\", \"owner_role\":\"ROLE\", \"acceptance\":[\"...\"]}}\n  ]\n}}\n\
         제약:\n\
         - owner_role은 다음 중 하나만 사용: {}\n\
         - subtasks는 1~{}개\n\
         - 각 subtask는 서로 다른 산출물을 갖도록 분해\n\
         - acceptance는 검증 가능한 문장 1~3개\n\n\
         사용자 요청:\n{}\n",
        workers.join(", "),
        max_subtasks.max(1),
        user_prompt.trim()
    )
}

/// First planning call; returns a normalized plan, falling back when the
/// model output is not usable JSON.
pub async fn build_task_execution_plan(
    llm: &dyn LlmClient,
    project_root: &Path,
    user_prompt: &str,
    available_roles: &[String],
    max_subtasks: usize,
    command_timeout_sec: u64,
) -> Result<TaskPlan, GatewayError> {
    let workers = crate::roles::available_worker_roles(available_roles);
    let prompt = planner_prompt(user_prompt, &workers, max_subtasks);
    let raw = llm
        .exec(project_root, &prompt, command_timeout_sec.clamp(90, 600))
        .await?;
    let parsed = parse_json_object_from_text(&raw);
    Ok(normalize_task_plan_payload(parsed.as_ref(), user_prompt, &workers, max_subtasks))
}

/// Critic call. A failed call or non-JSON output is absorbed as approval.
pub async fn critique_task_execution_plan(
    llm: &dyn LlmClient,
    project_root: &Path,
    user_prompt: &str,
    plan: &TaskPlan,
    command_timeout_sec: u64,
) -> PlanCritic {
    let payload = serde_json::to_string(plan).unwrap_or_default();
    let critic_prompt = format!(
        "너는 task plan critic이다. 아래 계획의 누락/과도분해/검증불가 항목을 점검해라.\n\
         반드시 JSON 객체만 출력한다. 설명 문장 금지.\n\
         JSON 스키마:\n\
         {{\n  \"approved\": true|false,\n  \"issues\": [\"...\"],\n  \"recommendations\": [\"...\"]\n}}\n\
         규칙:\n\
         - issues는 치명/중요 문제만\n\
         - recommendations는 실행 가능한 수정 제안만\n\n\
         사용자 요청:\n{}\n\n\
         plan:\n{}\n",
        user_prompt.trim(),
        payload
    );

    let parsed = match llm
        .exec(project_root, &critic_prompt, command_timeout_sec.clamp(90, 480))
        .await
    {
        Ok(raw) => parse_json_object_from_text(&raw),
        Err(_) => None,
    };

    let mut critic = PlanCritic::default();
    if let Some(parsed) = parsed {
        critic.approved = parsed.get("approved").and_then(Value::as_bool).unwrap_or(true);
        if let Some(items) = parsed.get("issues").and_then(Value::as_array) {
            critic.issues = items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .take(5)
                .collect();
        }
        if let Some(items) = parsed.get("recommendations").and_then(Value::as_array) {
            critic.recommendations = items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .take(5)
                .collect();
        }
    }
    critic
}

/// Repair call: feeds the current plan and critic back to the planner.
#[allow(clippy::too_many_arguments)]
pub async fn repair_task_execution_plan(
    llm: &dyn LlmClient,
    project_root: &Path,
    user_prompt: &str,
    current_plan: &TaskPlan,
    critic: &PlanCritic,
    available_roles: &[String],
    max_subtasks: usize,
    attempt_no: u32,
    command_timeout_sec: u64,
) -> Result<TaskPlan, GatewayError> {
    let workers = crate::roles::available_worker_roles(available_roles);
    let current_payload = serde_json::to_string(current_plan).unwrap_or_default();
    let critic_payload = serde_json::to_string(critic).unwrap_or_default();

    let repair_prompt = format!(
        "너는 task planner다. critic 이슈를 반영해 계획을 고쳐라.\n\
         반드시 JSON 객체만 출력한다. 설명 문장 금지.\n\
         JSON 스키마:\n\
         {{\n  \"summary\": \"한 줄 요약\",\n  \"subtasks\": [\n    {{\"id\":\"S1\", \"title\":\"...\", \"goal\":\"...\", \"owner_role\":\"ROLE\", \"acceptance\":[\"...\"]}}\n  ]\n}}\n\
         제약:\n\
         - owner_role은 다음 중 하나만 사용: {}\n\
         - subtasks는 1~{}개\n\
         - acceptance는 검증 가능한 문장 1~3개\n\
         - critic issues를 가능한 한 모두 해소\n\n\
         attempt: {}\n\
         사용자 요청:\n{}\n\n\
         current_plan:\n{}\n\n\
         critic:\n{}\n",
        workers.join(", "),
        max_subtasks.max(1),
        attempt_no,
        user_prompt.trim(),
        current_payload,
        critic_payload
    );

    let raw = llm
        .exec(project_root, &repair_prompt, command_timeout_sec.clamp(90, 600))
        .await?;
    let parsed = parse_json_object_from_text(&raw);
    Ok(normalize_task_plan_payload(parsed.as_ref(), user_prompt, &workers, max_subtasks))
}

/// Deduplicated owner roles across the final subtasks.
pub fn plan_roles_from_subtasks(plan: &TaskPlan) -> Vec<String> {
    dedupe_roles(plan.subtasks.iter().map(|s| s.owner_role.as_str()))
}

/// Prepends the plan summary and subtask/acceptance checklist to the user
/// prompt for the orchestrator.
pub fn build_planned_dispatch_prompt(user_prompt: &str, plan: &TaskPlan, critic: &PlanCritic) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push("원사용자 요청:".to_string());
    lines.push(user_prompt.trim().to_string());
    lines.push(String::new());
    if !plan.summary.trim().is_empty() {
        lines.push("계획 요약:".to_string());
        lines.push(plan.summary.trim().to_string());
        lines.push(String::new());
    }

    lines.push("실행할 sub-task:".to_string());
    for row in &plan.subtasks {
        let title = if row.title.trim().is_empty() { "subtask" } else { row.title.trim() };
        let goal = if row.goal.trim().is_empty() { title } else { row.goal.trim() };
        let role = if row.owner_role.trim().is_empty() { "Worker" } else { row.owner_role.trim() };
        let sid = if row.id.trim().is_empty() { "S" } else { row.id.trim() };
        lines.push(format!("- {} [{}] {}: {}", sid, role, title, goal));
    }

    let approved = !critic_has_blockers(critic);
    if !approved || !critic.issues.is_empty() || !critic.recommendations.is_empty() {
        lines.push(String::new());
        lines.push("critic 체크:".to_string());
        for item in critic.issues.iter().take(5) {
            lines.push(format!("- issue: {}", item));
        }
        for item in critic.recommendations.iter().take(5) {
            lines.push(format!("- fix: {}", item));
        }
    }

    lines.push(String::new());
    lines.push("위 계획과 체크사항을 반영해 역할별 실행/검증 결과를 산출해라.".to_string());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use serde_json::json;

    fn workers() -> Vec<String> {
        vec!["DataEngineer".to_string(), "Reviewer".to_string()]
    }

    #[test]
    fn json_extraction_finds_embedded_object() {
        let text = "thinking...\n{\"summary\": \"s\", \"subtasks\": []}\ntrailing";
        let obj = parse_json_object_from_text(text).unwrap();
        assert_eq!(obj["summary"], "s");
        assert!(parse_json_object_from_text("no json here").is_none());
        assert!(parse_json_object_from_text("[1,2,3]").is_none());
    }

    #[test]
    fn normalize_restricts_owner_roles_to_worker_set() {
        let parsed = json!({
            "summary": "do things",
            "subtasks": [
                {"id": "S1", "title": "collect", "goal": "collect data", "owner_role": "reviewer", "acceptance": ["a"]},
                {"title": "made-up", "goal": "g", "owner_role": "Hacker"},
            ]
        });
        let plan = normalize_task_plan_payload(Some(&parsed), "prompt", &workers(), 4);
        assert_eq!(plan.subtasks.len(), 2);
        assert_eq!(plan.subtasks[0].owner_role, "Reviewer");
        // unknown role falls back to the positional worker
        assert_eq!(plan.subtasks[1].owner_role, "Reviewer");
        assert_eq!(plan.subtasks[1].id, "S2");
        assert_eq!(plan.subtasks[1].acceptance.len(), 1);
    }

    #[test]
    fn normalize_caps_subtasks() {
        let rows: Vec<Value> = (0..10)
            .map(|i| json!({"id": format!("S{}", i), "title": "t", "goal": "g", "owner_role": "Reviewer"}))
            .collect();
        let parsed = json!({"subtasks": rows});
        let plan = normalize_task_plan_payload(Some(&parsed), "prompt", &workers(), 3);
        assert_eq!(plan.subtasks.len(), 3);
        assert_eq!(plan.meta.max_subtasks, 3);
    }

    #[test]
    fn normalize_falls_back_to_single_subtask() {
        let plan = normalize_task_plan_payload(None, "핵심 요청", &workers(), 4);
        assert_eq!(plan.subtasks.len(), 1);
        assert_eq!(plan.subtasks[0].id, "S1");
        assert_eq!(plan.subtasks[0].goal, "핵심 요청");
        assert_eq!(plan.subtasks[0].owner_role, "DataEngineer");
        assert_eq!(plan.summary, "subtasks=1");
    }

    #[test]
    fn critic_blocker_rules() {
        let mut critic = PlanCritic::default();
        assert!(!critic_has_blockers(&critic));
        critic.issues.push("missing step".into());
        assert!(critic_has_blockers(&critic));
        let critic = PlanCritic {
            approved: false,
            issues: vec![],
            recommendations: vec![],
        };
        assert!(critic_has_blockers(&critic));
    }

    #[test]
    fn plan_roles_dedupe_across_subtasks() {
        let parsed = json!({"subtasks": [
            {"title": "a", "owner_role": "Reviewer"},
            {"title": "b", "owner_role": "reviewer"},
            {"title": "c", "owner_role": "DataEngineer"},
        ]});
        let plan = normalize_task_plan_payload(Some(&parsed), "p", &workers(), 4);
        assert_eq!(plan_roles_from_subtasks(&plan), vec!["Reviewer", "DataEngineer"]);
    }

    #[test]
    fn planned_dispatch_prompt_carries_checklist() {
        let plan = normalize_task_plan_payload(None, "핵심 요청", &workers(), 4);
        let critic = PlanCritic {
            approved: false,
            issues: vec!["coverage gap".into()],
            recommendations: vec!["add a check".into()],
        };
        let prompt = build_planned_dispatch_prompt("핵심 요청", &plan, &critic);
        assert!(prompt.contains("원사용자 요청:"));
        assert!(prompt.contains("- S1 [DataEngineer]"));
        assert!(prompt.contains("- issue: coverage gap"));
        assert!(prompt.contains("- fix: add a check"));
    }

    #[tokio::test]
    async fn build_plan_uses_llm_json() {
        let llm = MockLlm::with_reply(
            r#"{"summary": "two parts", "subtasks": [{"id": "S1", "title": "t", "goal": "g", "owner_role": "Reviewer", "acceptance": ["ok"]}]}"#,
        );
        let plan = build_task_execution_plan(&llm, Path::new("/tmp"), "prompt", &workers(), 4, 300)
            .await
            .unwrap();
        assert_eq!(plan.summary, "two parts");
        assert_eq!(plan.subtasks[0].owner_role, "Reviewer");
    }

    #[tokio::test]
    async fn critique_absorbs_non_json_as_approved() {
        let llm = MockLlm::with_reply("I think it's fine.");
        let plan = normalize_task_plan_payload(None, "p", &workers(), 4);
        let critic = critique_task_execution_plan(&llm, Path::new("/tmp"), "p", &plan, 300).await;
        assert!(critic.approved);
        assert!(critic.issues.is_empty());
    }

    #[tokio::test]
    async fn critique_parses_issue_lists() {
        let llm = MockLlm::with_reply(r#"{"approved": false, "issues": ["gap", ""], "recommendations": ["fix"]}"#);
        let plan = normalize_task_plan_payload(None, "p", &workers(), 4);
        let critic = critique_task_execution_plan(&llm, Path::new("/tmp"), "p", &plan, 300).await;
        assert!(!critic.approved);
        assert_eq!(critic.issues, vec!["gap"]);
        assert_eq!(critic.recommendations, vec!["fix"]);
    }
}
