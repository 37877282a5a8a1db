//! Error types for the CLI CSAP.
//!
//! Every failure reaches the caller as a single `Error` value. Callers that
//! only care about the category can use [`Error::kind`].

use std::io;
use std::time::Duration;

use crate::csap::CsapId;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    // -------------------------------------------------------------------------
    // Specification errors
    // -------------------------------------------------------------------------
    /// Malformed specification, missing mandatory field, or contradictory
    /// prompt/credential presence.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A buffer sized from a declared field length could not be allocated.
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    /// Operation is not provided by this layer.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    // -------------------------------------------------------------------------
    // Runtime errors
    // -------------------------------------------------------------------------
    /// Pipe, thread, poll, read or write failure.
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// The expect supervisor has exited. Permanent for the CSAP.
    #[error("CLI session is not running")]
    NotRunning,

    /// Waiting for a prompt exceeded the per-CSAP timeout.
    ///
    /// Reserved: the CLI layer never returns it. Prompt timeouts surface as
    /// `Outcome::Timeout` and the supervisor retries them, so only the
    /// `ErrorKind::Timeout` category is visible to protocols sharing this
    /// error space.
    #[error("timed out after {0:?} waiting for prompt")]
    Timeout(Duration),

    /// Pipe framing anomaly (short write, truncated frame).
    #[error("sync protocol failure: {0}")]
    FatalProtocol(String),

    /// The supervisor could not bring the session up.
    #[error("lower layer failed: {0}")]
    LowerLayer(String),

    // -------------------------------------------------------------------------
    // Registry errors
    // -------------------------------------------------------------------------
    #[error("CSAP {0} does not exist")]
    NoSuchCsap(CsapId),

    #[error("no protocol support registered for layer '{0}'")]
    UnknownProtocol(String),

    /// Another operation is in flight on this CSAP.
    #[error("CSAP {0} is busy with another operation")]
    Busy(CsapId),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Flat error category, mirroring the error kinds of the TE error space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    OutOfMemory,
    NotSupported,
    Io,
    NotRunning,
    Timeout,
    FatalProtocol,
    LowerLayer,
    NotFound,
    Busy,
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn io(context: &'static str, source: io::Error) -> Self {
        Self::Io { context, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) | Error::Config(_) => ErrorKind::InvalidArgument,
            Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Error::NotSupported(_) => ErrorKind::NotSupported,
            Error::Io { .. } => ErrorKind::Io,
            Error::NotRunning => ErrorKind::NotRunning,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::FatalProtocol(_) => ErrorKind::FatalProtocol,
            Error::LowerLayer(_) => ErrorKind::LowerLayer,
            Error::NoSuchCsap(_) | Error::UnknownProtocol(_) => ErrorKind::NotFound,
            Error::Busy(_) => ErrorKind::Busy,
        }
    }
}

/// A specialized Result type for CLI CSAP operations.
pub type Result<T> = std::result::Result<T, Error>;
