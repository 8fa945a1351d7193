pub mod bus;
pub mod db;
pub mod error;

pub use bus::EventBus;
pub use error::{EventError, Result};
