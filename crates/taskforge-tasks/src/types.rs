use serde::{Deserialize, Serialize};

/// What a task executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Spawn a script subprocess.
    Script,
    /// Run one agent turn.
    Agent,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Script => "script",
            TaskKind::Agent => "agent",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script" => Ok(TaskKind::Script),
            "agent" => Ok(TaskKind::Agent),
            other => Err(format!("unknown task kind: {other}")),
        }
    }
}

/// Task lifecycle state.
///
/// pending -> running -> completed | failed; failed -> pending via retry;
/// pending tasks can be cancelled (deleted). Only the task store moves
/// tasks between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
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

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Fields for task creation. Scripts carry `script_path` + `params`;
/// agent turns carry `prompt` and optionally `chat_id`.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub kind: Option<TaskKind>,
    pub script_path: Option<String>,
    pub params: Option<serde_json::Value>,
    pub prompt: Option<String>,
    pub chat_id: Option<i64>,
    pub workspace: Option<String>,
}

impl NewTask {
    pub fn script(script_path: impl Into<String>) -> Self {
        Self {
            kind: Some(TaskKind::Script),
            script_path: Some(script_path.into()),
            ..Default::default()
        }
    }

    pub fn agent(prompt: impl Into<String>) -> Self {
        Self {
            kind: Some(TaskKind::Agent),
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_chat(mut self, chat_id: i64) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }
}

/// A unit of work claimed and executed by exactly one worker.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: i64,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub script_path: Option<String>,
    pub params: Option<serde_json::Value>,
    pub prompt: Option<String>,
    pub chat_id: Option<i64>,
    pub workspace: Option<String>,
    pub claimed_by: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: String,
}

impl Task {
    /// Secret keys declared under `params.required_secrets`.
    pub fn required_secrets(&self) -> Vec<String> {
        self.params
            .as_ref()
            .and_then(|p| p.get("required_secrets"))
            .and_then(|v| v.as_array())
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}
