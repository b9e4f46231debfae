//! Application state shared across all route handlers.

use std::sync::Arc;
use std::time::Instant;

use docent_chat::{ChatCoordinator, SessionRegistry};
use docent_core::config::DocentConfig;

/// Shared application state.
///
/// All fields use `Arc` for cheap cloning across handler tasks.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<DocentConfig>,
    /// Answers questions and streams replies.
    pub coordinator: Arc<ChatCoordinator>,
    /// Live sessions and their store.
    pub registry: Arc<SessionRegistry>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: DocentConfig, coordinator: ChatCoordinator) -> Self {
        let registry = coordinator.registry().clone();
        Self {
            config: Arc::new(config),
            coordinator: Arc::new(coordinator),
            registry,
            start_time: Instant::now(),
        }
    }
}
