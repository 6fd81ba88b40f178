//! Voice assistant server: drives the streaming response-to-speech pipeline
//! and exposes it over HTTP and a WebSocket event feed.
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod routes;
pub mod session;
pub mod state;
pub mod validation;

pub use orchestrator::{Collaborators, Orchestrator, PipelineConfig};
pub use routes::{router, AppState};
