//! Agent invocation capability.
//!
//! The engine treats an agent as an opaque, possibly slow, possibly failing
//! remote call with a uniform request/response contract. The shipped
//! implementation drives a `claude`-style CLI subprocess, feeding the prompt
//! through stdin and reading a stream of JSON events from stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::errors::ConductorError;
use crate::model::task::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Analyst,
    Planner,
    Developer,
    Reviewer,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyst => "analyst",
            Self::Planner => "planner",
            Self::Developer => "developer",
            Self::Reviewer => "reviewer",
        }
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyst" => Ok(Self::Analyst),
            "planner" => Ok(Self::Planner),
            "developer" => Ok(Self::Developer),
            "reviewer" => Ok(Self::Reviewer),
            _ => Err(format!("Invalid agent kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub kind: AgentKind,
    pub prompt: String,
    pub workspace: PathBuf,
    pub task_id: String,
    pub display_name: String,
    pub resume_session_id: Option<String>,
    pub fork_session: bool,
    pub attachments: Vec<PathBuf>,
}

impl AgentRequest {
    pub fn new(kind: AgentKind, prompt: &str, workspace: &Path, task_id: &str) -> Self {
        Self {
            kind,
            prompt: prompt.to_string(),
            workspace: workspace.to_path_buf(),
            task_id: task_id.to_string(),
            display_name: kind.as_str().to_string(),
            resume_session_id: None,
            fork_session: false,
            attachments: Vec::new(),
        }
    }

    pub fn with_resume(mut self, session_id: &str, fork: bool) -> Self {
        self.resume_session_id = Some(session_id.to_string());
        self.fork_session = fork;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    pub output: String,
    pub session_id: Option<String>,
    pub usage: Usage,
    pub cost_usd: f64,
}

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse>;
}

/// One line of the agent CLI's stream-json output. Only the result event
/// carries fields the engine needs; everything else is accumulated text.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamLine {
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        usage: Option<StreamUsage>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize, Default)]
struct StreamUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Drives an agent CLI subprocess.
pub struct CliAgentInvoker {
    command: String,
    timeout: Duration,
}

impl CliAgentInvoker {
    pub fn new(command: &str, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            timeout,
        }
    }

    fn build_command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");
        if let Some(session) = &request.resume_session_id {
            cmd.arg("--resume").arg(session);
            if request.fork_session {
                cmd.arg("--fork-session");
            }
        }
        cmd.current_dir(&request.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    async fn run(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let mut child = self
            .build_command(request)
            .spawn()
            .context("Failed to spawn agent process")?;

        let mut prompt = request.prompt.clone();
        for attachment in &request.attachments {
            prompt.push_str(&format!("\n\n[attachment: {}]", attachment.display()));
        }

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("Failed to write prompt to agent stdin")?;
            stdin.shutdown().await.context("Failed to close agent stdin")?;
        }

        let stdout = child.stdout.take().context("Failed to capture agent stdout")?;
        let mut lines = BufReader::new(stdout).lines();

        let mut accumulated = String::new();
        let mut response = AgentResponse::default();
        let mut is_error = false;

        while let Some(line) = lines.next_line().await.context("Failed to read agent output")? {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamLine>(&line) {
                Ok(StreamLine::Result {
                    result,
                    is_error: err,
                    session_id,
                    usage,
                    total_cost_usd,
                }) => {
                    if let Some(text) = result {
                        response.output = text;
                    }
                    response.session_id = session_id;
                    if let Some(u) = usage {
                        response.usage = Usage {
                            input_tokens: u.input_tokens,
                            output_tokens: u.output_tokens,
                        };
                    }
                    response.cost_usd = total_cost_usd.unwrap_or(0.0);
                    is_error = err;
                }
                Ok(StreamLine::Other) => {}
                Err(_) => {
                    // Not JSON; keep it as raw output.
                    accumulated.push_str(&line);
                    accumulated.push('\n');
                }
            }
        }

        let status = child.wait().await.context("Failed to wait for agent process")?;

        if response.output.is_empty() {
            response.output = accumulated;
        }

        if is_error || !status.success() {
            let detail = if response.output.is_empty() {
                format!("exit code {:?}", status.code())
            } else {
                response.output.chars().take(500).collect()
            };
            return Err(ConductorError::Agent(format!(
                "{} agent for task {} failed: {}",
                request.kind.as_str(),
                request.task_id,
                detail
            ))
            .into());
        }

        Ok(response)
    }
}

#[async_trait]
impl AgentInvoker for CliAgentInvoker {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse> {
        match tokio::time::timeout(self.timeout, self.run(request)).await {
            Ok(result) => result,
            Err(_) => Err(ConductorError::Timeout {
                operation: format!("{} agent invocation", request.kind.as_str()),
                seconds: self.timeout.as_secs(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_result_line_parses() {
        let line = r#"{"type":"result","result":"done","is_error":false,"session_id":"s-1","usage":{"input_tokens":12,"output_tokens":34},"total_cost_usd":0.07}"#;
        match serde_json::from_str::<StreamLine>(line).unwrap() {
            StreamLine::Result {
                result,
                session_id,
                usage,
                total_cost_usd,
                is_error,
            } => {
                assert_eq!(result.as_deref(), Some("done"));
                assert_eq!(session_id.as_deref(), Some("s-1"));
                assert_eq!(usage.unwrap().output_tokens, 34);
                assert_eq!(total_cost_usd, Some(0.07));
                assert!(!is_error);
            }
            _ => panic!("expected result line"),
        }
    }

    #[test]
    fn test_unknown_stream_line_is_other() {
        let line = r#"{"type":"assistant","message":{"content":[]}}"#;
        assert!(matches!(
            serde_json::from_str::<StreamLine>(line).unwrap(),
            StreamLine::Other
        ));
    }

    #[test]
    fn test_agent_kind_roundtrip() {
        for kind in [
            AgentKind::Analyst,
            AgentKind::Planner,
            AgentKind::Developer,
            AgentKind::Reviewer,
        ] {
            assert_eq!(kind.as_str().parse::<AgentKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_request_builder_resume() {
        let req = AgentRequest::new(AgentKind::Developer, "build it", Path::new("/tmp"), "t1")
            .with_resume("sess-9", true);
        assert_eq!(req.resume_session_id.as_deref(), Some("sess-9"));
        assert!(req.fork_session);
        assert_eq!(req.display_name, "developer");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_classified_as_timeout() {
        use std::os::unix::fs::PermissionsExt;

        // A stub agent that ignores its arguments and hangs past the deadline.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-agent.sh");
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\nsleep 5\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let invoker = CliAgentInvoker::new(script.to_str().unwrap(), Duration::from_millis(100));
        let req = AgentRequest::new(AgentKind::Analyst, "hi", dir.path(), "t1");
        let err = invoker.invoke(&req).await.unwrap_err();
        let classified = crate::errors::classify_error(&err);
        assert_eq!(classified.kind, crate::errors::ErrorKind::Timeout);
        assert!(classified.retryable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_invoker_parses_result_stream() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-agent.sh");
        std::fs::write(
            &script,
            concat!(
                "#!/bin/sh\n",
                "cat > /dev/null\n",
                "echo '{\"type\":\"system\",\"subtype\":\"init\"}'\n",
                "echo '{\"type\":\"result\",\"result\":\"analysis done\",\"is_error\":false,",
                "\"session_id\":\"s-42\",\"usage\":{\"input_tokens\":7,\"output_tokens\":3},",
                "\"total_cost_usd\":0.01}'\n",
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let invoker = CliAgentInvoker::new(script.to_str().unwrap(), Duration::from_secs(5));
        let req = AgentRequest::new(AgentKind::Analyst, "analyze", dir.path(), "t1");
        let response = invoker.invoke(&req).await.unwrap();
        assert_eq!(response.output, "analysis done");
        assert_eq!(response.session_id.as_deref(), Some("s-42"));
        assert_eq!(response.usage.input_tokens, 7);
        assert!((response.cost_usd - 0.01).abs() < f64::EPSILON);
    }
}
