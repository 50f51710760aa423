//! Error types for the session engine
//!
//! Every public operation returns [`Result`]. Asynchronous failures (ICE
//! negotiation, decryption, remote close) are never returned from here;
//! they reach the application through the stream callbacks.

use thiserror::Error;

/// Errors returned by session, stream, channel and port-forwarding operations
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed peer id, out-of-range component count, bad protocol, malformed SDP
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is not valid in the current session/stream/channel state
    #[error("wrong state: {0}")]
    WrongState(String),

    /// Transport is not connected yet
    #[error("not ready")]
    NotReady,

    /// Unknown stream, channel, service or port forwarding
    #[error("not exist: {0}")]
    NotExist(String),

    /// Duplicate service or session
    #[error("already exist: {0}")]
    AlreadyExist(String),

    /// The session has already been started
    #[error("session already started")]
    AlreadyRun,

    /// Request or negotiation deadline exceeded
    #[error("operation timed out")]
    Timeout,

    /// Encryption, decryption or integrity check failed
    #[error("encryption failure")]
    EncryptionFailure,

    /// The peer asked us to hold off, or a local id space is exhausted
    #[error("busy")]
    Busy,

    /// The handle refers to a session that has been closed
    #[error("invalid descriptor")]
    InvalidDescriptor,

    /// Malformed wire input
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Numeric status carried in a session response for this error
    pub fn status_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => 1,
            Error::WrongState(_) => 18,
            Error::NotReady => 10,
            Error::NotExist(_) => 11,
            Error::AlreadyExist(_) => 12,
            Error::AlreadyRun => 9,
            Error::Timeout => 22,
            Error::EncryptionFailure => 21,
            Error::Busy => 19,
            Error::InvalidDescriptor => 17,
            Error::Protocol(_) => 6,
            Error::Io(_) => 2,
        }
    }
}
