//! Connection error types

use crate::exit::ExitState;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type for connection operations
pub type Result<T> = std::result::Result<T, ConnError>;

/// Errors that can occur while dialing or using a command connection
///
/// I/O sources are kept behind an [`Arc`] so the error is cheap to clone;
/// [`CommandConn::close`](crate::CommandConn::close) hands the first outcome
/// back to every later caller.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnError {
    /// The helper program could not be located or started
    #[error("failed to start helper `{program}`: {source}")]
    Spawn {
        /// Program that was being started
        program: String,
        /// Underlying OS error
        #[source]
        source: Arc<io::Error>,
    },

    /// No helper is registered for the scheme of the helper URL
    #[error("no connection helper registered for scheme `{0}`")]
    UnsupportedScheme(String),

    /// The helper URL could not be turned into a command line
    #[error("invalid helper URL `{url}`: {reason}")]
    InvalidHelperUrl {
        /// Offending URL
        url: String,
        /// What was wrong with it
        reason: String,
    },

    /// Write attempted after `close_write` or `close`
    #[error("write half of the connection is closed")]
    ClosedWrite,

    /// Read attempted after `close_read` or `close`
    #[error("read half of the connection is closed")]
    ClosedRead,

    /// The child exited or stopped reading its stdin
    #[error("broken pipe{}", describe_exit(.0))]
    BrokenPipe(Option<ExitState>),

    /// The child closed its stdout and did not exit cleanly
    #[error("unexpected end of stream: {0}")]
    UnexpectedEof(ExitState),

    /// A read or write deadline elapsed
    #[error("i/o deadline exceeded")]
    Timeout,

    /// Any other I/O failure on the pipes
    #[error("i/o error: {0}")]
    Io(#[source] Arc<io::Error>),
}

fn describe_exit(exit: &Option<ExitState>) -> String {
    match exit {
        Some(state) => format!(": {state}"),
        None => String::new(),
    }
}

impl ConnError {
    pub(crate) fn spawn(program: impl Into<String>, source: io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidHelperUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error reports the end of the child's output
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::UnexpectedEof(_))
    }

    /// Whether this error is a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Exit information attached to EOF and broken-pipe errors
    pub fn exit_state(&self) -> Option<&ExitState> {
        match self {
            Self::UnexpectedEof(state) => Some(state),
            Self::BrokenPipe(state) => state.as_ref(),
            _ => None,
        }
    }

    /// Whether the protocol layer may reasonably retry the whole logical
    /// request on a fresh connection
    ///
    /// The connection itself never retries.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::BrokenPipe(_) | Self::UnexpectedEof(_) | Self::Timeout
        )
    }
}

impl From<io::Error> for ConnError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::BrokenPipe => Self::BrokenPipe(None),
            _ => Self::Io(Arc::new(err)),
        }
    }
}

impl From<ConnError> for io::Error {
    fn from(err: ConnError) -> Self {
        let kind = match &err {
            ConnError::Spawn { source, .. } => source.kind(),
            ConnError::UnsupportedScheme(_) | ConnError::InvalidHelperUrl { .. } => {
                io::ErrorKind::InvalidInput
            }
            ConnError::ClosedWrite | ConnError::ClosedRead => io::ErrorKind::NotConnected,
            ConnError::BrokenPipe(_) => io::ErrorKind::BrokenPipe,
            ConnError::UnexpectedEof(_) => io::ErrorKind::UnexpectedEof,
            ConnError::Timeout => io::ErrorKind::TimedOut,
            ConnError::Io(source) => source.kind(),
        };
        io::Error::new(kind, err)
    }
}
