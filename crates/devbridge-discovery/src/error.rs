//! Discovery error types

use thiserror::Error;

/// Errors that can occur during service discovery
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    Mdns(String),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
