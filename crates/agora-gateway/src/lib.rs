//! Real-time side of agora: WebSocket sessions, the conversation registry,
//! and every operation that commits and fans out an event.

pub mod audit;
pub mod auth;
pub mod config;
pub mod connection;
pub mod conversations;
pub mod error;
pub mod hub;
pub mod mentions;
pub mod moderation;
pub mod pipeline;
pub mod presence;
pub mod rate_limit;
pub mod reactions;
pub mod reaper;
pub mod registry;
pub mod sessions;

pub use auth::{AuthVerifier, JwtVerifier};
pub use config::HubConfig;
pub use error::{HubError, HubResult};
pub use hub::{Connected, Hub};
