//! Error types produced by client operations.
//!
//! Every operation resolves with at most one error. The variants split along
//! the line that matters for failover: errors that carry a definite answer
//! from an endpoint (`Expected`) are final, transport-level failures that
//! happened before any request body byte was written (`Transport`,
//! `UnexpectedStatus`) may be retried against the next endpoint, and
//! everything else is terminal for the operation.

use std::fmt;

/// Boxed error type used for body streams and error sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error returned by every client operation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A caller-supplied argument failed validation before any request was
    /// sent (malformed key, empty bootstrap list, bad header value).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller supplied an expected content MD5 and the digest computed
    /// while streaming disagreed. The stored object has already been deleted
    /// on a best-effort basis by the time this error surfaces.
    #[error("content digest mismatch: expected {expected}, computed {computed}")]
    InvalidDigest {
        /// Digest the caller declared for the payload.
        expected: String,
        /// Digest computed over the bytes actually streamed.
        computed: String,
    },

    /// The endpoint answered with a definite non-success status (404 and
    /// other 4xx). The operation has its answer; it is never retried.
    #[error("request failed with status {status}")]
    Expected {
        /// Numeric HTTP status code of the response.
        status: u16,
    },

    /// The endpoint answered with a status outside the expected set (5xx,
    /// or a success-class status the operation cannot interpret).
    #[error("unexpected response status {status}")]
    UnexpectedStatus {
        /// Numeric HTTP status code of the response.
        status: u16,
    },

    /// Connecting to or talking to an endpoint failed before any request
    /// body byte was written.
    #[error("transport error contacting {endpoint}")]
    Transport {
        /// `host:port` of the endpoint that failed.
        endpoint: String,
        /// Underlying connect or socket error.
        #[source]
        source: BoxError,
    },

    /// The connection failed after body streaming had begun. The body
    /// source is not replayable, so the operation is not retried.
    #[error("connection to {endpoint} failed mid-stream")]
    MidStream {
        /// `host:port` of the endpoint that failed.
        endpoint: String,
        /// Underlying socket error.
        #[source]
        source: BoxError,
    },

    /// The caller's body stream reported an error, aborting the upload.
    #[error("upload aborted by the caller")]
    VoluntaryAbort,

    /// Failure of the random source or a violated internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failover controller may retry this outcome on the next
    /// endpoint. Retrying is additionally gated on the request body not
    /// having started streaming.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::UnexpectedStatus { .. }
        )
    }

    /// Whether the error is a definite answer from the backend rather than
    /// a failure to obtain one. Log sinks downgrade these to non-errors.
    pub fn is_expected(&self) -> bool {
        matches!(self, Error::Expected { .. })
    }

    /// HTTP status code carried by the error, if the endpoint responded.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Expected { status } | Error::UnexpectedStatus { status } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn transport(endpoint: impl fmt::Display, source: impl Into<BoxError>) -> Self {
        Error::Transport {
            endpoint: endpoint.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn mid_stream(endpoint: impl fmt::Display, source: impl Into<BoxError>) -> Self {
        Error::MidStream {
            endpoint: endpoint.to_string(),
            source: source.into(),
        }
    }
}
