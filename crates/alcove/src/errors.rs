use std::time::Duration;

use thiserror::Error;

/// The connection handshake failed, or the handle it produced is gone.
/// Fatal to the call that raised it; recoverable by loading the applet again.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("applet failed to connect before the timeout was reached ({0:?})")]
    Timeout(Duration),
    #[error("applet connection is closed")]
    Closed,
}

/// An action invocation failed on the applet side or never completed.
#[derive(Debug, Error, PartialEq)]
pub enum ExecutionError {
    #[error("action handler failed to complete before the timeout was reached ({0:?})")]
    Timeout(Duration),
    #[error("{0}")]
    Handler(String),
    #[error("applet disconnected")]
    Disconnected,
}

/// Transport-level failure inside the message relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay channel closed")]
    Closed,
}
