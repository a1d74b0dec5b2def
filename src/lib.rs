//! # call-bridge
//!
//! WebSocket bridge between a telephony platform and an OpenAI-compatible
//! chat-completion API.
//!
//! ## Modules:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **error**: frame decode and relay error types
//! - **protocol**: JSON event codec for the call socket
//! - **prompt**: turns a caller request into chat messages
//! - **relay**: completion providers producing fragment streams
//! - **coordinator**: per-call turn state, barge-in abandonment
//! - **session**: the WebSocket actor, one per call
//! - **state**: shared handles and counters
//! - **health**: liveness endpoint

pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod prompt;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod state;

use actix_web::web;

/// Path the telephony platform connects to.
pub const CALL_PATH: &str = "/llm-websocket";

/// Register every HTTP route of the bridge.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route(CALL_PATH, web::get().to(session::call_websocket))
        .route("/health", web::get().to(health::health_check));
}
