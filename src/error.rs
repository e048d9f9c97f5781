//! Error types for the tunnel.

use thiserror::Error;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while tunneling.
#[derive(Error, Debug)]
pub enum Error {
    /// Peer violated the on-wire contract (bad version, bad address
    /// type, truncated record). Fatal for the affected stream only.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Credentials mismatch during the user/pass sub-negotiation.
    #[error("authentication failed")]
    Auth,

    /// Outbound TCP dial to the target failed.
    #[error("target unreachable: {0}")]
    Unreachable(String),

    /// Peer asked for something the engine does not do (non-CONNECT
    /// command, no acceptable auth method).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Transport-level failure: socket error, keepalive miss, elapsed
    /// deadline. Closes the whole RDT session.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Stream multiplexer failure.
    #[error("mux error: {0}")]
    Mux(String),

    /// Invalid configuration. Fatal at startup, before any traffic.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a transport error from a plain message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(std::io::Error::new(std::io::ErrorKind::Other, msg.into()))
    }

    /// Transport error for an elapsed read/write deadline.
    pub fn timed_out(what: &str) -> Self {
        Error::Transport(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("{what} deadline elapsed"),
        ))
    }

    /// Check whether this error should tear down the whole session
    /// rather than just the stream it occurred on.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Mux(_))
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Transport(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Auth;
        assert_eq!(err.to_string(), "authentication failed");

        let err = Error::protocol("bad version");
        assert_eq!(err.to_string(), "protocol error: bad version");
    }

    #[test]
    fn test_session_fatality() {
        assert!(Error::timed_out("read").is_fatal_for_session());
        assert!(!Error::Auth.is_fatal_for_session());
        assert!(!Error::protocol("x").is_fatal_for_session());
    }
}
