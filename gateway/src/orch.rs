//! Orchestrator and worker executables, invoked as subprocesses that return
//! JSON (or plain text) on stdout. The seam is a trait so handlers can run
//! against a mock in tests.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::error::GatewayError;
use crate::render::render_add_role_summary;
use crate::store::ProjectEntry;

/// Filesystem anchors of the project an invocation targets.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub project_root: PathBuf,
    pub team_dir: PathBuf,
}

impl From<&ProjectEntry> for ProjectPaths {
    fn from(entry: &ProjectEntry) -> Self {
        ProjectPaths {
            project_root: entry.project_root_path(),
            team_dir: entry.team_dir_path(),
        }
    }
}

/// Per-run options assembled from config plus message-level overrides.
#[derive(Debug, Clone)]
pub struct OrchRunOptions {
    pub priority: String,
    pub timeout_sec: u64,
    pub poll_sec: f64,
    pub roles_csv: String,
    pub no_spawn_missing: bool,
    pub no_wait: bool,
    pub chat_id: String,
}

/// Runs a prepared command with a timeout, capturing stdout/stderr.
pub(crate) async fn run_command(
    mut cmd: Command,
    label: &str,
    timeout_sec: u64,
) -> Result<std::process::Output, GatewayError> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let timeout = Duration::from_secs(timeout_sec.max(5));
    let child = cmd
        .spawn()
        .map_err(|e| GatewayError::other(format!("{} failed to start: {}", label, e)))?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(GatewayError::other(format!("{} failed: {}", label, e))),
        Err(_) => Err(GatewayError::Timeout(label.to_string(), timeout.as_secs())),
    }
}

fn output_text(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !stdout.is_empty() {
        return stdout;
    }
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn truncated(text: &str, cap: usize) -> String {
    text.chars().take(cap).collect()
}

/// Orchestrator + worker command surface.
#[async_trait]
pub trait OrchClient: Send + Sync {
    /// `run`: dispatch a prompt to worker roles, returning the JSON snapshot.
    async fn run(&self, paths: &ProjectPaths, prompt: &str, opts: &OrchRunOptions) -> Result<Value, GatewayError>;

    /// `status`: plain-text project status.
    async fn status(&self, paths: &ProjectPaths) -> Result<String, GatewayError>;

    /// `init`: idempotent project initialization.
    async fn init(&self, paths: &ProjectPaths, overview: &str) -> Result<String, GatewayError>;

    /// `spawn`: start worker sessions.
    async fn spawn(&self, paths: &ProjectPaths) -> Result<String, GatewayError>;

    /// `add-role`: register a worker role; returns a rendered summary.
    async fn add_role(
        &self,
        paths: &ProjectPaths,
        role: &str,
        provider: Option<&str>,
        launch: Option<&str>,
        spawn: bool,
    ) -> Result<String, GatewayError>;

    /// Worker `request`: JSON snapshot for a request id.
    async fn request(&self, paths: &ProjectPaths, request_id: &str) -> Result<Value, GatewayError>;

    /// Worker `fail <message_id>`: cancel one pending assignment.
    async fn fail_message(&self, paths: &ProjectPaths, message_id: &str, actor: &str, note: &str) -> (bool, String);
}

/// Subprocess-backed client for the `aoe-orch` and `aoe-team` binaries.
#[derive(Debug, Clone)]
pub struct OrchExec {
    pub orch_bin: String,
    pub team_bin: String,
    pub command_timeout_sec: u64,
}

#[async_trait]
impl OrchClient for OrchExec {
    async fn run(&self, paths: &ProjectPaths, prompt: &str, opts: &OrchRunOptions) -> Result<Value, GatewayError> {
        let priority = {
            let p = opts.priority.trim().to_uppercase();
            if matches!(p.as_str(), "P1" | "P2" | "P3") {
                p
            } else {
                "P2".to_string()
            }
        };

        let mut cmd = Command::new(&self.orch_bin);
        cmd.arg("run")
            .arg("--project-root")
            .arg(&paths.project_root)
            .arg("--team-dir")
            .arg(&paths.team_dir)
            .arg("--priority")
            .arg(priority)
            .arg("--timeout-sec")
            .arg(opts.timeout_sec.max(1).to_string())
            .arg("--poll-sec")
            .arg(opts.poll_sec.to_string())
            .arg("--channel")
            .arg("telegram")
            .arg("--origin")
            .arg(format!("telegram:{}", opts.chat_id))
            .arg("--json");
        if !opts.roles_csv.trim().is_empty() {
            cmd.arg("--roles").arg(opts.roles_csv.trim());
        }
        if opts.no_spawn_missing {
            cmd.arg("--no-spawn-missing");
        }
        if opts.no_wait {
            cmd.arg("--no-wait");
        }
        cmd.arg(prompt);

        let output = run_command(cmd, "aoe-orch run", self.command_timeout_sec).await?;
        if !output.status.success() {
            return Err(GatewayError::other(format!(
                "aoe-orch run failed: {}",
                truncated(&output_text(&output), 1000)
            )));
        }
        let payload = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let data: Value = serde_json::from_str(&payload).map_err(|_| {
            GatewayError::other(format!(
                "aoe-orch run returned non-JSON output: {}",
                truncated(&payload, 800)
            ))
        })?;
        if !data.is_object() {
            return Err(GatewayError::other("aoe-orch run JSON is not an object"));
        }
        Ok(data)
    }

    async fn status(&self, paths: &ProjectPaths) -> Result<String, GatewayError> {
        let mut cmd = Command::new(&self.orch_bin);
        cmd.arg("status")
            .arg("--project-root")
            .arg(&paths.project_root)
            .arg("--team-dir")
            .arg(&paths.team_dir);
        let output = run_command(cmd, "aoe-orch status", 60).await?;
        let text = output_text(&output);
        if !output.status.success() {
            return Err(GatewayError::other(format!("aoe-orch status failed: {}", truncated(&text, 1200))));
        }
        Ok(text)
    }

    async fn init(&self, paths: &ProjectPaths, overview: &str) -> Result<String, GatewayError> {
        if paths.team_dir.join("orchestrator.json").exists() {
            return Ok("[SKIP] already initialized (.aoe-team/orchestrator.json exists)".to_string());
        }
        let mut cmd = Command::new(&self.orch_bin);
        cmd.arg("init")
            .arg("--project-root")
            .arg(&paths.project_root)
            .arg("--overview")
            .arg(overview);
        let output = run_command(cmd, "aoe-orch init", self.command_timeout_sec.max(60)).await?;
        let text = output_text(&output);
        if !output.status.success() {
            return Err(GatewayError::other(format!("aoe-orch init failed: {}", truncated(&text, 1200))));
        }
        Ok(if text.is_empty() { "[OK] initialized".to_string() } else { text })
    }

    async fn spawn(&self, paths: &ProjectPaths) -> Result<String, GatewayError> {
        let mut cmd = Command::new(&self.orch_bin);
        cmd.arg("spawn")
            .arg("--project-root")
            .arg(&paths.project_root)
            .arg("--team-dir")
            .arg(&paths.team_dir);
        let output = run_command(cmd, "aoe-orch spawn", self.command_timeout_sec.max(60)).await?;
        let text = output_text(&output);
        if !output.status.success() {
            return Err(GatewayError::other(format!("aoe-orch spawn failed: {}", truncated(&text, 1200))));
        }
        Ok(if text.is_empty() { "[OK] spawned".to_string() } else { text })
    }

    async fn add_role(
        &self,
        paths: &ProjectPaths,
        role: &str,
        provider: Option<&str>,
        launch: Option<&str>,
        spawn: bool,
    ) -> Result<String, GatewayError> {
        let mut cmd = Command::new(&self.orch_bin);
        cmd.arg("add-role")
            .arg("--project-root")
            .arg(&paths.project_root)
            .arg("--team-dir")
            .arg(&paths.team_dir)
            .arg("--role")
            .arg(role)
            .arg("--json");
        if let Some(provider) = provider {
            cmd.arg("--provider").arg(provider);
        }
        if let Some(launch) = launch {
            cmd.arg("--launch").arg(launch);
        }
        cmd.arg(if spawn { "--spawn" } else { "--no-spawn" });

        let output = run_command(cmd, "aoe-orch add-role", 60).await?;
        let payload = output_text(&output);
        if !output.status.success() {
            return Err(GatewayError::other(format!(
                "aoe-orch add-role failed: {}",
                truncated(&payload, 1200)
            )));
        }
        match serde_json::from_str::<Value>(&payload) {
            Ok(data) if data.is_object() => Ok(render_add_role_summary(&data, role, provider, launch)),
            _ => Ok(if payload.is_empty() {
                format!("[OK] role added: {}", role)
            } else {
                payload
            }),
        }
    }

    async fn request(&self, paths: &ProjectPaths, request_id: &str) -> Result<Value, GatewayError> {
        let mut cmd = Command::new(&self.team_bin);
        cmd.arg("request")
            .arg("--request-id")
            .arg(request_id)
            .arg("--json")
            .env("AOE_TEAM_DIR", &paths.team_dir);
        let output = run_command(cmd, "aoe-team request", 60).await?;
        let payload = output_text(&output);
        if !output.status.success() {
            return Err(GatewayError::other(format!(
                "aoe-team request failed: {}",
                truncated(&payload, 1200)
            )));
        }
        let data: Value = serde_json::from_str(&payload).map_err(|_| {
            GatewayError::other(format!(
                "aoe-team request returned non-JSON output: {}",
                truncated(&payload, 800)
            ))
        })?;
        if !data.is_object() {
            return Err(GatewayError::other("aoe-team request JSON is not an object"));
        }
        Ok(data)
    }

    async fn fail_message(&self, paths: &ProjectPaths, message_id: &str, actor: &str, note: &str) -> (bool, String) {
        let mut cmd = Command::new(&self.team_bin);
        cmd.arg("fail").arg(message_id).arg("--force").arg("--note").arg(note);
        if !actor.trim().is_empty() {
            cmd.arg("--for").arg(actor);
        }
        cmd.env("AOE_TEAM_DIR", &paths.team_dir);
        match run_command(cmd, "aoe-team fail", 60).await {
            Ok(output) => (output.status.success(), output_text(&output)),
            Err(e) => (false, e.to_string()),
        }
    }
}

/// Roles configured for a project, read from `orchestrator.json` in the team
/// dir (coordinator role first, then agents). Unreadable files yield an
/// empty set.
pub fn load_orchestrator_roles(team_dir: &Path) -> Vec<String> {
    let cfg = team_dir.join("orchestrator.json");
    let Ok(content) = std::fs::read_to_string(&cfg) else {
        return Vec::new();
    };
    let Ok(data) = serde_json::from_str::<Value>(&content) else {
        return Vec::new();
    };
    if !data.is_object() {
        return Vec::new();
    }

    let mut roles: Vec<String> = Vec::new();
    if let Some(coordinator) = data.get("coordinator").filter(|v| v.is_object()) {
        let role = coordinator
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if !role.is_empty() {
            roles.push(role);
        }
    }
    if let Some(agents) = data.get("agents").and_then(Value::as_array) {
        for row in agents {
            let role = match row {
                Value::Object(_) => row.get("role").and_then(Value::as_str).unwrap_or_default().trim().to_string(),
                Value::String(s) => s.trim().to_string(),
                _ => String::new(),
            };
            if !role.is_empty() {
                roles.push(role);
            }
        }
    }

    crate::store::dedupe_roles(roles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_roles_from_orchestrator_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("orchestrator.json"),
            r#"{"coordinator": {"role": "Orchestrator"}, "agents": [{"role": "DataEngineer"}, "Reviewer", {"role": "Reviewer"}]}"#,
        )
        .unwrap();
        let roles = load_orchestrator_roles(dir.path());
        assert_eq!(roles, vec!["Orchestrator", "DataEngineer", "Reviewer"]);
    }

    #[test]
    fn load_roles_missing_or_bad_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_orchestrator_roles(dir.path()).is_empty());
        std::fs::write(dir.path().join("orchestrator.json"), "nope").unwrap();
        assert!(load_orchestrator_roles(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn run_command_captures_stdout() {
        let mut cmd = Command::new("/bin/echo");
        cmd.arg("hello");
        let out = run_command(cmd, "echo", 10).await.unwrap();
        assert!(out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn run_command_missing_binary_is_error() {
        let cmd = Command::new("/definitely/not/a/binary");
        let err = run_command(cmd, "ghost", 10).await.unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }
}
