pub mod db;
pub mod error;
pub mod projection;
pub mod store;
pub mod types;

pub use error::{ChatError, Result};
pub use store::ChatStore;
pub use types::{Chat, ChatUpdate, HistoryEntry, Message, MessageRole, NewChat, TranscriptItem, Usage};
