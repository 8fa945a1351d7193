use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::agent::{AgentMessage, AgentRequest, AgentRunner, ContentBlock};
use crate::error::{Result, WorkerError};

/// Agent runner that delegates to the Claude Code CLI
/// (`claude -p --output-format stream-json`).
///
/// The CLI handles tool execution internally; this runner only parses
/// the line-delimited JSON stream into [`AgentMessage`] values.
pub struct CliAgentRunner {
    command: String,
}

impl CliAgentRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl AgentRunner for CliAgentRunner {
    async fn run(&self, req: AgentRequest, tx: mpsc::Sender<AgentMessage>) -> Result<()> {
        // System prompt goes through a temp file so it never hits argv
        // limits. Keep the handle alive until the child exits.
        let sys_file = match &req.system_prompt {
            Some(system) => {
                let file = tempfile::Builder::new()
                    .prefix("taskforge-sys-")
                    .suffix(".txt")
                    .tempfile()
                    .map_err(|e| {
                        WorkerError::AgentUnavailable(format!("failed to create temp file: {e}"))
                    })?;
                std::fs::write(file.path(), system).map_err(|e| {
                    WorkerError::AgentUnavailable(format!("failed to write system prompt: {e}"))
                })?;
                Some(file)
            }
            None => None,
        };

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--model")
            .arg(&req.model)
            .arg("--max-turns")
            .arg(req.max_turns.to_string())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        if let Some(ref file) = sys_file {
            cmd.arg("--system-prompt-file").arg(file.path());
        }
        for tool in &req.allowed_tools {
            cmd.arg("--allowedTools").arg(tool);
        }
        if let Some(ref workspace) = req.workspace {
            cmd.current_dir(workspace);
        }

        debug!(
            command = %self.command,
            model = %req.model,
            prompt_len = req.prompt.len(),
            "spawning agent CLI"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WorkerError::AgentUnavailable(format!(
                    "agent CLI not found at '{}'",
                    self.command
                ))
            } else {
                WorkerError::AgentUnavailable(format!("failed to spawn agent CLI: {e}"))
            }
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(req.prompt.as_bytes())
                .await
                .map_err(|e| WorkerError::AgentProcess(format!("stdin write failed: {e}")))?;
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::AgentProcess("no stdout from agent CLI".into()))?;

        // Drain stderr concurrently so a chatty child never blocks on a
        // full pipe.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = String::new();
            if let Some(mut stream) = stderr {
                let _ = stream.read_to_string(&mut buf).await;
            }
            buf
        });

        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| WorkerError::AgentProcess(format!("stdout read failed: {e}")))?
        {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let frame: serde_json::Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "unparseable agent stream line");
                    continue;
                }
            };
            let message = parse_frame(&frame);
            if tx.send(message).await.is_err() {
                // receiver dropped, stop reading and reap the child
                break;
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| WorkerError::AgentProcess(format!("agent CLI wait failed: {e}")))?;
        let stderr_text = stderr_task.await.unwrap_or_default();
        if !status.success() {
            let code = status.code().unwrap_or(1);
            return Err(WorkerError::AgentProcess(format!(
                "agent CLI exited with code {code}: {}",
                stderr_text.trim()
            )));
        }
        Ok(())
    }
}

/// Map one stream-json frame to an [`AgentMessage`].
///
/// Frames: `{"type":"assistant","message":{"content":[...]}}` with
/// content blocks `{"type":"text","text":...}` and
/// `{"type":"tool_use","name":...,"input":...}`;
/// `{"type":"result","usage":{"input_tokens":N,"output_tokens":N}}`.
fn parse_frame(frame: &serde_json::Value) -> AgentMessage {
    match frame.get("type").and_then(|t| t.as_str()) {
        Some("assistant") => {
            let blocks = frame
                .pointer("/message/content")
                .and_then(|c| c.as_array())
                .map(|raw| raw.iter().filter_map(parse_block).collect())
                .unwrap_or_default();
            AgentMessage::Assistant { blocks }
        }
        Some("result") => AgentMessage::Result {
            input_tokens: frame
                .pointer("/usage/input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            output_tokens: frame
                .pointer("/usage/output_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        },
        _ => AgentMessage::Other,
    }
}

fn parse_block(block: &serde_json::Value) -> Option<ContentBlock> {
    match block.get("type").and_then(|t| t.as_str())? {
        "text" => Some(ContentBlock::Text {
            text: block.get("text")?.as_str()?.to_string(),
        }),
        "tool_use" => Some(ContentBlock::ToolUse {
            name: block
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("tool")
                .to_string(),
            input: block.get("input").cloned().unwrap_or(serde_json::Value::Null),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_frame_with_blocks() {
        let frame = serde_json::json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Checking."},
                {"type": "tool_use", "name": "Bash", "input": {"command": "ls"}},
                {"type": "unknown_block"}
            ]}
        });
        match parse_frame(&frame) {
            AgentMessage::Assistant { blocks } => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(&blocks[0], ContentBlock::Text { text } if text == "Checking."));
                assert!(
                    matches!(&blocks[1], ContentBlock::ToolUse { name, .. } if name == "Bash")
                );
            }
            other => panic!("expected assistant message, got {other:?}"),
        }
    }

    #[test]
    fn parses_result_frame_usage() {
        let frame = serde_json::json!({
            "type": "result",
            "usage": {"input_tokens": 120, "output_tokens": 45}
        });
        match parse_frame(&frame) {
            AgentMessage::Result {
                input_tokens,
                output_tokens,
            } => {
                assert_eq!(input_tokens, 120);
                assert_eq!(output_tokens, 45);
            }
            other => panic!("expected result message, got {other:?}"),
        }
    }

    #[test]
    fn unknown_frames_map_to_other() {
        let frame = serde_json::json!({"type": "system", "subtype": "init"});
        assert!(matches!(parse_frame(&frame), AgentMessage::Other));
    }
}
