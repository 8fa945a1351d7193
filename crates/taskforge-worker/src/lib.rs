pub mod agent;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod script;
pub mod turn;
pub mod worker;

pub use agent::{AgentMessage, AgentRequest, AgentRunner, ContentBlock};
pub use dispatch::{Dispatcher, Outcome};
pub use error::{Result, WorkerError};
pub use worker::Worker;
