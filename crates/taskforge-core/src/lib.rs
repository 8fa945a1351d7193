pub mod config;
pub mod db;
pub mod error;

pub use config::ForgeConfig;
pub use error::{CoreError, Result};
