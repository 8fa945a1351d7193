use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// A conversation with the configuration its agent turns run under.
#[derive(Debug, Clone, Serialize)]
pub struct Chat {
    pub id: i64,
    pub tenant: String,
    pub system_prompt: String,
    pub workspace: Option<String>,
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields for chat creation.
#[derive(Debug, Clone)]
pub struct NewChat {
    pub tenant: String,
    pub system_prompt: String,
    pub workspace: Option<String>,
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
    pub metadata: Option<serde_json::Value>,
}

impl NewChat {
    pub fn new(tenant: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            system_prompt: system_prompt.into(),
            workspace: None,
            allowed_tools: Vec::new(),
            max_turns: 50,
            metadata: None,
        }
    }
}

/// Partial update for chat fields. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatUpdate {
    pub system_prompt: Option<String>,
    pub workspace: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub max_turns: Option<u32>,
    pub metadata: Option<serde_json::Value>,
}

impl ChatUpdate {
    pub fn is_empty(&self) -> bool {
        self.system_prompt.is_none()
            && self.workspace.is_none()
            && self.allowed_tools.is_none()
            && self.max_turns.is_none()
            && self.metadata.is_none()
    }
}

/// One entry in a chat's ordered message log.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub sequence: i64,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub created_at: String,
}

/// Role + content pair used to prime the next agent turn.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub role: MessageRole,
    pub content: String,
}

/// Aggregated token totals over a set of messages.
#[derive(Debug, Clone, Serialize)]
pub struct Usage {
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub message_count: i64,
}

/// One row of the tool-interleaved transcript projection.
///
/// Real messages keep their id/sequence/token fields; synthesized
/// per-turn entries (role `assistant` from text events, role `tool_use`)
/// only carry role, content, and timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_input: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_output: Option<i64>,
    pub created_at: Option<String>,
}

impl TranscriptItem {
    pub fn from_message(m: &Message) -> Self {
        Self {
            id: Some(m.id),
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
            sequence: Some(m.sequence),
            tokens_input: Some(m.tokens_input),
            tokens_output: Some(m.tokens_output),
            created_at: Some(m.created_at.clone()),
        }
    }

    pub fn event(role: &str, content: String, created_at: Option<String>) -> Self {
        Self {
            id: None,
            role: role.to_string(),
            content,
            sequence: None,
            tokens_input: None,
            tokens_output: None,
            created_at,
        }
    }
}
