use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{instrument, warn};

use taskforge_chats::ChatStore;
use taskforge_events::EventBus;
use taskforge_secrets::SecretsVault;
use taskforge_tasks::{Task, TaskKind};

use crate::agent::{AgentMessage, AgentRequest, AgentRunner, ContentBlock};
use crate::env::EnvGuard;
use crate::script::run_script;
use crate::turn::run_chat_turn;

/// How a task execution ended. `Success` carries the result payload
/// stored on the task; `Failure` carries the error text.
#[derive(Debug)]
pub enum Outcome {
    Success(serde_json::Value),
    Failure(String),
}

/// Routes a claimed task to its executor and packages the result.
pub struct Dispatcher {
    pub vault: Arc<SecretsVault>,
    pub chats: Arc<ChatStore>,
    pub bus: Arc<EventBus>,
    pub runner: Arc<dyn AgentRunner>,
    /// Model identifier announced in `start` events and passed to the
    /// runner.
    pub model: String,
    pub script_timeout: Duration,
    /// Connection string passed through to script subprocesses.
    pub database_url: String,
}

impl Dispatcher {
    #[instrument(skip(self, task), fields(task_id = task.id, kind = task.kind.as_str()))]
    pub async fn dispatch(&self, task: &Task, default_workspace: Option<&str>) -> Outcome {
        let workspace = task
            .workspace
            .clone()
            .or_else(|| default_workspace.map(String::from))
            .unwrap_or_else(|| ".".to_string());

        match task.kind {
            TaskKind::Script => self.dispatch_script(task, &workspace).await,
            TaskKind::Agent => match task.chat_id {
                Some(chat_id) => self.dispatch_chat_turn(task, chat_id).await,
                None => self.dispatch_one_shot(task).await,
            },
        }
    }

    async fn dispatch_script(&self, task: &Task, workspace: &str) -> Outcome {
        let Some(script_path) = task.script_path.as_deref() else {
            return Outcome::Failure("No script_path provided".into());
        };

        // Clean environment: passthrough basics plus resolved secrets.
        // Scripts are expected to handle missing secrets themselves.
        let mut env = HashMap::new();
        for key in ["PATH", "HOME"] {
            if let Ok(value) = std::env::var(key) {
                env.insert(key.to_string(), value);
            }
        }
        if !self.database_url.is_empty() {
            env.insert("DATABASE_URL".to_string(), self.database_url.clone());
        }
        match self.vault.bulk_get(&task.required_secrets(), None) {
            Ok(secrets) => env.extend(secrets),
            Err(e) => warn!(task_id = task.id, error = %e, "secret resolution failed"),
        }

        let output = run_script(
            script_path,
            task.params.as_ref(),
            Path::new(workspace),
            &env,
            self.script_timeout,
        )
        .await;

        if output.success {
            Outcome::Success(serde_json::json!({
                "success": true,
                "output": output.output,
                "metadata": output.metadata,
            }))
        } else {
            Outcome::Failure(output.output)
        }
    }

    /// Agent task without a chat: single run with empty history, no
    /// event streaming, collect the final text and usage.
    async fn dispatch_one_shot(&self, task: &Task) -> Outcome {
        let Some(prompt) = task.prompt.as_deref() else {
            return Outcome::Failure("No prompt provided".into());
        };

        let secrets = match self.vault.bulk_get(&task.required_secrets(), None) {
            Ok(secrets) => secrets,
            Err(e) => return Outcome::Failure(format!("secret resolution failed: {e}")),
        };
        let _env = EnvGuard::export(&secrets);

        let request = AgentRequest {
            prompt: prompt.to_string(),
            system_prompt: None,
            allowed_tools: Vec::new(),
            max_turns: 50,
            workspace: task.workspace.clone(),
            model: self.model.clone(),
        };

        let (tx, mut rx) = mpsc::channel::<AgentMessage>(64);
        let runner = self.runner.clone();
        let handle = tokio::spawn(async move { runner.run(request, tx).await });

        let mut parts: Vec<String> = Vec::new();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        while let Some(message) = rx.recv().await {
            match message {
                AgentMessage::Assistant { blocks } => {
                    for block in blocks {
                        if let ContentBlock::Text { text } = block {
                            parts.push(text);
                        }
                    }
                }
                AgentMessage::Result {
                    input_tokens: i,
                    output_tokens: o,
                } => {
                    input_tokens = i;
                    output_tokens = o;
                }
                AgentMessage::Other => {}
            }
        }

        match handle.await {
            Ok(Ok(())) => Outcome::Success(serde_json::json!({
                "success": true,
                "output": parts.join("\n"),
                "input_tokens": input_tokens,
                "output_tokens": output_tokens,
            })),
            Ok(Err(e)) => Outcome::Failure(e.to_string()),
            Err(e) => Outcome::Failure(format!("agent task panicked: {e}")),
        }
    }

    async fn dispatch_chat_turn(&self, task: &Task, chat_id: i64) -> Outcome {
        let Some(prompt) = task.prompt.as_deref() else {
            return Outcome::Failure("No prompt provided".into());
        };

        let secrets = match self.vault.bulk_get(&task.required_secrets(), None) {
            Ok(secrets) => secrets,
            Err(e) => return Outcome::Failure(format!("secret resolution failed: {e}")),
        };
        let _env = EnvGuard::export(&secrets);

        let outcome = run_chat_turn(
            &self.chats,
            &self.bus,
            self.runner.clone(),
            task,
            chat_id,
            prompt,
            &self.model,
        )
        .await;

        if outcome.success {
            Outcome::Success(serde_json::json!({
                "success": true,
                "output": outcome.output,
                "input_tokens": outcome.input_tokens,
                "output_tokens": outcome.output_tokens,
                "tool_count": outcome.tool_count,
            }))
        } else {
            Outcome::Failure(
                outcome
                    .error
                    .unwrap_or_else(|| "agent turn failed".to_string()),
            )
        }
    }
}
