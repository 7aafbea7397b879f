//! devbridge Core - Shared types used across all bridge components
//!
//! This crate provides the configuration model, the control-packet framer
//! used by the WebSocket proxy, and small networking helpers.

pub mod config;
pub mod framing;
pub mod net;

pub use config::Config;
pub use framing::PacketFramer;
pub use net::primary_ipv4;
