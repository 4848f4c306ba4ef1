//! Agent interface and per-brand CLI adapters

use async_trait::async_trait;
use keel_core::config::{AgentBrand, AgentDefinition};
use keel_core::{KeelError, Result};
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::types::{AgentRequest, AgentResponse, Constraints, InvokeStatus, Usage};

/// A planner, worker or reviewer the engine can call
///
/// Transport problems (spawn failure, timeout, unparseable output) are
/// returned as errors. A response with `InvokeStatus::Failed` means the agent
/// ran and reported failure itself.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    async fn invoke(&self, request: &AgentRequest, constraints: &Constraints)
        -> Result<AgentResponse>;
}

/// Raw output of an agent process
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Spawns an agent CLI, feeds the rendered request on stdin and collects output
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    extra_args: Vec<String>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>, extra_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            extra_args,
        }
    }

    #[instrument(skip(self, request, constraints, args), fields(program = %self.program, request_id = %request.request_id))]
    pub async fn run(
        &self,
        agent: &str,
        args: &[&str],
        request: &AgentRequest,
        constraints: &Constraints,
    ) -> Result<ProcessOutput> {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .args(&self.extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.workdir {
            command.current_dir(dir);
        }

        debug!("spawning {} {:?}", self.program, args);
        let mut child = command
            .spawn()
            .map_err(|e| KeelError::Agent(format!("Failed to spawn {}: {}", self.program, e)))?;

        let input = request.render();
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
            // Closing stdin tells the CLI the prompt is complete
            drop(stdin);
        }

        let output = tokio::time::timeout(constraints.timeout, child.wait_with_output())
            .await
            .map_err(|_| KeelError::AgentTimeout {
                agent: agent.to_string(),
                timeout_ms: constraints.timeout.as_millis() as u64,
            })??;

        Ok(ProcessOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        })
    }
}

#[derive(Deserialize)]
struct Envelope {
    status: InvokeStatus,
    #[serde(default)]
    artifact: String,
    #[serde(default)]
    structured: Option<serde_json::Value>,
    #[serde(default)]
    clarification: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

/// Turn process output into a response
///
/// A JSON object on stdout is read as the response envelope; anything else is
/// taken as the artifact of a successful call.
pub fn parse_output(agent: &str, output: ProcessOutput) -> Result<AgentResponse> {
    if !output.success {
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        return Err(KeelError::Agent(format!("{} exited with failure: {}", agent, detail)));
    }

    let text = output.stdout.trim();
    if text.is_empty() {
        return Err(KeelError::MalformedOutput {
            agent: agent.to_string(),
            detail: "empty output".to_string(),
        });
    }

    if text.starts_with('{') {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| KeelError::MalformedOutput {
                agent: agent.to_string(),
                detail: e.to_string(),
            })?;
        if envelope.status == InvokeStatus::NeedsClarification && envelope.clarification.is_none()
        {
            return Err(KeelError::MalformedOutput {
                agent: agent.to_string(),
                detail: "needs_clarification without a question".to_string(),
            });
        }
        return Ok(AgentResponse {
            status: envelope.status,
            artifact: envelope.artifact,
            structured: envelope.structured,
            clarification: envelope.clarification,
            usage: envelope.usage,
        });
    }

    Ok(AgentResponse::success(text))
}

/// Claude Code CLI in print mode
pub struct ClaudeAgent {
    id: String,
    runner: ProcessRunner,
}

impl ClaudeAgent {
    pub fn new(id: impl Into<String>, runner: ProcessRunner) -> Self {
        Self {
            id: id.into(),
            runner,
        }
    }
}

#[async_trait]
impl Agent for ClaudeAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        request: &AgentRequest,
        constraints: &Constraints,
    ) -> Result<AgentResponse> {
        let mut args = vec!["-p"];
        if constraints.read_only {
            args.extend(["--permission-mode", "plan"]);
        }
        let output = self.runner.run(&self.id, &args, request, constraints).await?;
        parse_output(&self.id, output)
    }
}

/// Codex CLI, non-interactive `exec` reading the prompt from stdin
pub struct CodexAgent {
    id: String,
    runner: ProcessRunner,
}

impl CodexAgent {
    pub fn new(id: impl Into<String>, runner: ProcessRunner) -> Self {
        Self {
            id: id.into(),
            runner,
        }
    }
}

#[async_trait]
impl Agent for CodexAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        request: &AgentRequest,
        constraints: &Constraints,
    ) -> Result<AgentResponse> {
        let sandbox = if constraints.read_only {
            "read-only"
        } else {
            "workspace-write"
        };
        let args = ["exec", "--sandbox", sandbox, "-"];
        let output = self.runner.run(&self.id, &args, request, constraints).await?;
        parse_output(&self.id, output)
    }
}

/// Gemini CLI
pub struct GeminiAgent {
    id: String,
    runner: ProcessRunner,
}

impl GeminiAgent {
    pub fn new(id: impl Into<String>, runner: ProcessRunner) -> Self {
        Self {
            id: id.into(),
            runner,
        }
    }
}

#[async_trait]
impl Agent for GeminiAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        request: &AgentRequest,
        constraints: &Constraints,
    ) -> Result<AgentResponse> {
        let mut args = Vec::new();
        if !constraints.read_only {
            args.push("--yolo");
        }
        let output = self.runner.run(&self.id, &args, request, constraints).await?;
        parse_output(&self.id, output)
    }
}

/// Build the adapter for a configured agent
pub fn build_agent(definition: &AgentDefinition) -> Arc<dyn Agent> {
    let runner = ProcessRunner::new(definition.program(), definition.args.clone());
    match definition.brand {
        AgentBrand::Claude => Arc::new(ClaudeAgent::new(&definition.id, runner)),
        AgentBrand::Codex => Arc::new(CodexAgent::new(&definition.id, runner)),
        AgentBrand::Gemini => Arc::new(GeminiAgent::new(&definition.id, runner)),
    }
}
