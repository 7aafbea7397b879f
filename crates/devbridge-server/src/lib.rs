//! devbridge Server - Axum-based HTTP and WebSocket surface
//!
//! Serves the embedded UI, answers discovery and control queries, and runs
//! the WebSocket-to-TCP proxy sessions that carry flashing traffic.

pub mod gpio;
pub mod http;
pub mod state;
pub mod websocket;

pub use http::create_router;
pub use state::AppState;
