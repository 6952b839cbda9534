//! Errors surfaced at component seams

use thiserror::Error;

/// Device configuration lookup failures, reported to the caller of `add_device`
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("config lookup timed out after {0} ms")]
    Timeout(u64),
    #[error("config lookup request failed: {0}")]
    Http(String),
    #[error("config lookup returned status {0}")]
    Status(u16),
    #[error("malformed config response: {0}")]
    Malformed(String),
    #[error("config response is missing {0}")]
    MissingCredentials(&'static str),
    #[error("unknown device {0}")]
    UnknownDevice(String),
}

/// Broker connect failures
///
/// Only surfaced to callers for the initial connection; later losses are
/// absorbed by the reconnect loop.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectError {
    #[error("invalid broker endpoint {0:?}")]
    InvalidEndpoint(String),
    #[error("broker rejected connection: {0}")]
    Rejected(String),
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("broker connect timed out")]
    Timeout,
    #[error("connection manager is closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PublishError {
    #[error("broker is not connected")]
    NotConnected,
    #[error("connection manager is closed")]
    Closed,
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("broker client rejected publish: {0}")]
    Link(#[from] LinkError),
}

/// Transport-level request failure (client queue full or closed)
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct LinkError(pub String);
