pub mod error;
pub mod messages;
pub mod middleware;
pub mod moderation;

use agora_gateway::Hub;

/// Shared state for REST handlers. Every handler goes through the hub so
/// REST and WebSocket enforce the same rules.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
}

impl AppState {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }
}
