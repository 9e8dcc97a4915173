//! LLM subprocess boundary: a fallible `(prompt, timeout) → text` call.
//!
//! The executable writes its answer to a temp output file (stdout as
//! fallback); planning and synthesis treat failures as soft unless a gate is
//! enabled. `MockLlm` serves the tests.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::GatewayError;
use crate::orch::run_command;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One generation call rooted in the project directory.
    async fn exec(&self, project_root: &Path, prompt: &str, timeout_sec: u64) -> Result<String, GatewayError>;
}

/// Subprocess-backed client: `<bin> exec --skip-git-repo-check -C <root> -o <out> <prompt>`.
#[derive(Debug, Clone)]
pub struct LlmExec {
    pub bin: String,
}

#[async_trait]
impl LlmClient for LlmExec {
    async fn exec(&self, project_root: &Path, prompt: &str, timeout_sec: u64) -> Result<String, GatewayError> {
        let out_file = tempfile::Builder::new()
            .prefix("aoe_tg_")
            .suffix(".txt")
            .tempfile()
            .map_err(|e| GatewayError::other(format!("llm temp file: {}", e)))?;
        let out_path = out_file.path().to_path_buf();

        let mut cmd = Command::new(&self.bin);
        cmd.arg("exec")
            .arg("--skip-git-repo-check")
            .arg("-C")
            .arg(project_root)
            .arg("-o")
            .arg(&out_path)
            .arg(prompt);

        let label = format!("{} exec", self.bin);
        let output = run_command(cmd, &label, timeout_sec).await?;
        if !output.status.success() {
            let detail = {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                if stderr.is_empty() {
                    String::from_utf8_lossy(&output.stdout).trim().to_string()
                } else {
                    stderr
                }
            };
            return Err(GatewayError::other(format!(
                "{} failed: {}",
                label,
                detail.chars().take(1000).collect::<String>()
            )));
        }

        let mut body = std::fs::read_to_string(&out_path).unwrap_or_default().trim().to_string();
        if body.is_empty() {
            body = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        if body.is_empty() {
            return Err(GatewayError::other(format!("{} returned empty output", label)));
        }
        Ok(body)
    }
}

/// Fixed-response client for tests; records nothing, never fails unless told to.
#[derive(Debug, Clone, Default)]
pub struct MockLlm {
    pub replies: Vec<String>,
    pub fail: bool,
}

impl MockLlm {
    pub fn with_reply(reply: &str) -> Self {
        MockLlm {
            replies: vec![reply.to_string()],
            fail: false,
        }
    }

    pub fn failing() -> Self {
        MockLlm {
            replies: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn exec(&self, _project_root: &Path, _prompt: &str, _timeout_sec: u64) -> Result<String, GatewayError> {
        if self.fail {
            return Err(GatewayError::other("mock llm failure"));
        }
        Ok(self.replies.first().cloned().unwrap_or_else(|| "ok".to_string()))
    }
}
