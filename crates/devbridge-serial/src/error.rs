//! Serial bridge error types

use thiserror::Error;

/// Errors surfaced by the serial registry, servers and monitor
#[derive(Debug, Error)]
pub enum SerialError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },

    #[error("failed to bind listener for {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported baud rate: {0}")]
    InvalidBaud(u32),

    #[error("serial handle for {0} is closed")]
    Closed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SerialResult<T> = Result<T, SerialError>;
