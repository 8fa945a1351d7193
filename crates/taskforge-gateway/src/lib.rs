pub mod app;
pub mod auth;
pub mod http;

pub use app::{build_router, AppState};
