//! HTTP routes.

pub mod admin;
pub mod forward;
pub mod health;

pub use admin::{ReloadResponse, SaveResponse, reload_handler, save_handler};
pub use forward::{FileData, ForwardRequest, TransportFailure, forward_handler};
pub use health::{HealthResponse, health_handler, health_routes, status_handler};
