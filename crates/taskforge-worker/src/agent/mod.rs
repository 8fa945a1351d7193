//! The agent SDK boundary.
//!
//! The service treats the agent as a black box that, given a prompt and
//! per-chat configuration, yields a lazy, finite sequence of typed
//! messages over a channel. [`CliAgentRunner`] is the production
//! implementation; tests substitute scripted runners.

pub mod claude_cli;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use claude_cli::CliAgentRunner;

/// One content block inside an assistant message.
#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { name: String, input: serde_json::Value },
}

/// A message from the agent's stream.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    /// One assistant turn carrying ordered content blocks.
    Assistant { blocks: Vec<ContentBlock> },
    /// Final usage accounting for the run.
    Result { input_tokens: u64, output_tokens: u64 },
    /// Anything the orchestrator has no use for (init frames, etc.).
    Other,
}

/// Everything a runner needs to drive one agent run.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Rendered prompt: conversation history plus the new user message.
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// Tools the agent may invoke. Empty means the runner's default set.
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
    /// Working directory for the agent's tool executions.
    pub workspace: Option<String>,
    pub model: String,
}

/// Drives one agent run, sending each stream message through `tx` as it
/// arrives. The sequence is non-restartable; the channel closing marks
/// the end of the stream.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, req: AgentRequest, tx: mpsc::Sender<AgentMessage>) -> Result<()>;
}
