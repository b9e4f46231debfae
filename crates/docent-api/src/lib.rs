//! Docent API crate - axum HTTP server and route handlers.
//!
//! Exposes the streaming chat endpoint, session management, and a health
//! check.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
