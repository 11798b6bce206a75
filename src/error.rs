//! Error types for the acquisition buffer.
//!
//! `BufferError` is the single error type shared by the data stores, the wire
//! codec and the server. Using `thiserror`, it keeps a consistent message
//! format and lets lower-level errors flow upward with `?`.
//!
//! ## Error Hierarchy
//!
//! - **Store errors** (`InvalidHeader`, `NoHeader`, `ShapeMismatch`, `InvalidEvent`,
//!   `Range`): a request was well-formed but cannot be satisfied against the
//!   current buffer state. The connection handler answers with an error
//!   response and keeps the connection open.
//! - **`Persistence`**: the saving store failed to write or read its files.
//!   Reported to the client like a store error.
//! - **`Protocol`**: the request could not be parsed. Fatal to the connection.
//! - **`Connection`**: socket-level I/O failure. Fatal to the connection.
//! - **`Config` / `Figment`**: startup configuration problems. Fatal to the process.

use thiserror::Error;

/// Convenience alias for results using the buffer error type.
pub type AppResult<T> = std::result::Result<T, BufferError>;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("No header has been set")]
    NoHeader,

    #[error("Block does not match header: {0}")]
    ShapeMismatch(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Range {begin}..{end} not available (buffer holds {available})")]
    Range {
        begin: u64,
        end: u64,
        available: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Configuration validation error: {0}")]
    Config(String),

    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),
}

impl From<figment::Error> for BufferError {
    fn from(value: figment::Error) -> Self {
        BufferError::Figment(Box::new(value))
    }
}

impl BufferError {
    /// Builds a `Range` error describing the window that was actually available.
    pub fn range(begin: u64, end: u64, first: u64, total: u64) -> Self {
        BufferError::Range {
            begin,
            end,
            available: format!("{first}..{total}"),
        }
    }

    /// Whether the connection that hit this error can keep serving requests.
    ///
    /// Store-level failures become an error response; protocol and transport
    /// failures terminate the connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BufferError::InvalidHeader(_)
                | BufferError::NoHeader
                | BufferError::ShapeMismatch(_)
                | BufferError::InvalidEvent(_)
                | BufferError::Range { .. }
                | BufferError::Persistence(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_recoverable() {
        assert!(BufferError::NoHeader.is_recoverable());
        assert!(BufferError::InvalidHeader("nchans".into()).is_recoverable());
        assert!(BufferError::range(0, 7, 2, 7).is_recoverable());
    }

    #[test]
    fn transport_errors_are_fatal() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(!BufferError::from(io).is_recoverable());
        assert!(!BufferError::Protocol("bad version".into()).is_recoverable());
    }

    #[test]
    fn range_message_names_available_window() {
        let err = BufferError::range(0, 7, 2, 7);
        assert_eq!(
            err.to_string(),
            "Range 0..7 not available (buffer holds 2..7)"
        );
    }
}
