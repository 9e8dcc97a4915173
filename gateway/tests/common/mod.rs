//! Shared test harness: a recording transport, canned orchestrator/worker
//! client, and a gateway wired to a temp project directory.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use gateway::app::Gateway;
use gateway::config::GatewayConfig;
use gateway::error::GatewayError;
use gateway::llm::MockLlm;
use gateway::orch::{OrchClient, OrchRunOptions, ProjectPaths};
use gateway::telegram::{ChatTransport, Update};

pub const CHAT: &str = "1000001";

#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<String>>,
    pub batches: Mutex<Vec<Vec<Update>>>,
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn get_updates(&self, _offset: i64, _poll_timeout_sec: u64) -> Result<Vec<Update>, GatewayError> {
        Ok(self.batches.lock().unwrap().pop().unwrap_or_default())
    }

    async fn send_message(&self, _chat_id: &str, text: &str, _markup: Option<&Value>) -> Result<(), GatewayError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

pub struct MockOrch {
    pub snapshot: Value,
    pub fail_calls: Mutex<Vec<String>>,
}

impl MockOrch {
    pub fn with_snapshot(snapshot: Value) -> Self {
        MockOrch {
            snapshot,
            fail_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn completed(request_id: &str) -> Self {
        Self::with_snapshot(json!({
            "request_id": request_id,
            "roles": [
                {"role": "DataEngineer", "status": "done", "message_id": "m1"},
                {"role": "Reviewer", "status": "done", "message_id": "m2"},
            ],
            "counts": {"assignments": 2, "replies": 2},
            "done_roles": ["DataEngineer", "Reviewer"],
            "complete": true,
            "replies": [
                {"role": "DataEngineer", "body": "데이터 정리 완료"},
                {"role": "Reviewer", "body": "검토 통과"},
            ],
        }))
    }
}

#[async_trait]
impl OrchClient for MockOrch {
    async fn run(&self, _paths: &ProjectPaths, _prompt: &str, _opts: &OrchRunOptions) -> Result<Value, GatewayError> {
        Ok(self.snapshot.clone())
    }

    async fn status(&self, _paths: &ProjectPaths) -> Result<String, GatewayError> {
        Ok("mock orchestrator status".to_string())
    }

    async fn init(&self, _paths: &ProjectPaths, _overview: &str) -> Result<String, GatewayError> {
        Ok("[OK] initialized".to_string())
    }

    async fn spawn(&self, _paths: &ProjectPaths) -> Result<String, GatewayError> {
        Ok("[OK] spawned".to_string())
    }

    async fn add_role(
        &self,
        _paths: &ProjectPaths,
        role: &str,
        _provider: Option<&str>,
        _launch: Option<&str>,
        _spawn: bool,
    ) -> Result<String, GatewayError> {
        Ok(format!("role ready: {}", role))
    }

    async fn request(&self, _paths: &ProjectPaths, _request_id: &str) -> Result<Value, GatewayError> {
        Ok(self.snapshot.clone())
    }

    async fn fail_message(&self, _paths: &ProjectPaths, message_id: &str, _actor: &str, _note: &str) -> (bool, String) {
        self.fail_calls.lock().unwrap().push(message_id.to_string());
        (true, "failed ok".to_string())
    }
}

pub struct Harness {
    pub gw: Gateway,
    pub transport: Arc<RecordingTransport>,
    pub orch: Arc<MockOrch>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    /// Replies sent since the last drain.
    pub fn drain_sent(&self) -> Vec<String> {
        std::mem::take(&mut *self.transport.sent.lock().unwrap())
    }

    pub async fn message(&mut self, text: &str) -> Vec<String> {
        self.message_from(CHAT, text).await
    }

    pub async fn message_from(&mut self, chat_id: &str, text: &str) -> Vec<String> {
        self.drain_sent();
        self.gw.handle_text_message(chat_id, text, "test-trace").await;
        self.drain_sent()
    }
}

/// Writes an orchestrator role config so role loading sees a real team.
pub fn write_orchestrator_roles(team_dir: &std::path::Path, roles: &[&str]) {
    std::fs::create_dir_all(team_dir).unwrap();
    let agents: Vec<Value> = roles.iter().map(|r| json!({"role": r})).collect();
    let cfg = json!({"coordinator": {"role": "Orchestrator"}, "agents": agents});
    std::fs::write(
        team_dir.join("orchestrator.json"),
        serde_json::to_string_pretty(&cfg).unwrap(),
    )
    .unwrap();
}

pub fn harness_with(orch: MockOrch, llm: MockLlm, tune: impl FnOnce(&mut GatewayConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = GatewayConfig::for_project(dir.path());
    cfg.acl.allow.insert(CHAT.to_string());
    // Tests opt into planning/verifier behavior explicitly.
    cfg.task_planning = false;
    cfg.require_verifier = false;
    tune(&mut cfg);

    let transport = Arc::new(RecordingTransport::default());
    let orch = Arc::new(orch);
    let gw = Gateway::new(cfg, transport.clone(), orch.clone(), Arc::new(llm));
    Harness {
        gw,
        transport,
        orch,
        dir,
    }
}

pub fn harness(tune: impl FnOnce(&mut GatewayConfig)) -> Harness {
    harness_with(MockOrch::completed("req-mock-1"), MockLlm::with_reply("통합 응답"), tune)
}
