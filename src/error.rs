//! Error types for trace operations.

use thiserror::Error;

use crate::state::ProbeProtocol;

/// Fatal errors that stop a trace.
///
/// Malformed or unrelated reply packets are not errors; they are counted and
/// skipped by the engine (see [`crate::probe::Rejection`]).
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("{op} failed: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{protocol} probe incomplete: sent {sent} of {expected} bytes")]
    IncompleteSend {
        protocol: ProbeProtocol,
        sent: usize,
        expected: usize,
    },

    #[error("no probe protocol enabled")]
    NoProtocol,

    #[error("too many consecutive bad packets in ping mode ({count})")]
    TooManyBadPackets { count: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TraceError {
    /// Wrap an I/O error from the named socket operation.
    pub fn socket(op: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Socket { op, source }
    }

    /// Underlying OS error code, when the error came from a socket call
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            Self::Socket { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Result type alias for trace operations.
pub type TraceResult<T> = Result<T, TraceError>;
