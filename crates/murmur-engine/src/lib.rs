//! murmur-engine: Headless conversational session engine
//!
//! This crate provides the core of the murmur chat client, including:
//! - A bounded conversation window
//! - Request formatting for the completion service
//! - A single-in-flight request lifecycle with cancellation and timeouts
//! - Incremental reveal of responses
//! - Best-effort image fetches keyed on each response

pub mod buffer;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod formatter;
pub mod lifecycle;
pub mod reveal;
pub mod session;

// Re-export commonly used types
pub use buffer::{BufferError, ConversationBuffer, Turn, DEFAULT_CAPACITY};
pub use client::{
    ClientError, Completion, CompletionService, HttpCompletionClient, HttpImageClient,
    ImageArtifact, ImageService,
};
pub use config::{ConfigError, SessionConfig};
pub use dispatch::{ResponseFinalized, SideEffectDispatcher};
pub use formatter::{build_request, format_messages, ChatMessage, CompletionRequest, Role};
pub use lifecycle::{LifecycleState, RequestHandle, RequestId, RequestLifecycleController};
pub use reveal::{RevealHandle, RevealScheduler, RevealState, RevealStep};
pub use session::{
    start_session, SessionError, SessionEvent, SessionHandle, SessionParts, SessionView,
};

use std::sync::Arc;

/// Start a session talking to the HTTP services named in `config`.
pub fn start_http_session(config: SessionConfig) -> Result<SessionParts, ConfigError> {
    let http = reqwest::Client::new();
    let completions = Arc::new(HttpCompletionClient::with_client(
        http.clone(),
        config.completion_url.clone(),
    ));
    let images = Arc::new(HttpImageClient::with_client(http, config.image_url.clone()));
    start_session(config, completions, images)
}

/// Returns the engine version.
pub fn engine_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
