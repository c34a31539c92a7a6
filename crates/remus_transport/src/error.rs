//! Transport error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("No free TCP port at or above {start}")]
    NoFreePort { start: u16 },

    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        source: zmq::Error,
    },

    #[error("Socket error: {0}")]
    Socket(#[from] zmq::Error),
}
