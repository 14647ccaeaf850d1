//! Unified error types for the kvconf core.
//!
//! Each layer has its own error enum: path resolution, the flat key/value
//! codec, location parsing and the backend contract. Store-level errors live
//! in `kvconf-runtime`.

use thiserror::Error;

// =============================================================================
// Path Errors
// =============================================================================

/// Errors that can occur while walking a field path.
///
/// An index past the end of a sequence is *not* an error; it resolves to
/// `None` because the field is legitimately absent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// A sequence was addressed with a segment that is not an index.
    #[error("segment '{segment}' is not a sequence index")]
    NotAnIndex {
        /// The offending segment.
        segment: String,
    },

    /// The path continues below a value that has no children.
    #[error("unsupported path: cannot descend into {kind} with segment '{segment}'")]
    Unsupported {
        /// The segment that could not be applied.
        segment: String,
        /// Kind of the value the walk stopped at.
        kind: &'static str,
    },
}

// =============================================================================
// Codec Errors
// =============================================================================

/// Errors that can occur while converting between objects and flat entries.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Nothing to decode.
    #[error("no entries to decode")]
    Empty,

    /// The entry stored at a record root is not a JSON object.
    #[error("entry at '{key}' is not a JSON object")]
    RootNotObject {
        /// The root key.
        key: String,
    },

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// Location Errors
// =============================================================================

/// Errors that can occur while parsing a location URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    /// The location is empty.
    #[error("empty location")]
    Empty,

    /// `://` is present but nothing precedes it.
    #[error("missing scheme in '{0}'")]
    MissingScheme(String),

    /// A remote scheme without any host.
    #[error("missing host in '{0}'")]
    MissingHost(String),
}

// =============================================================================
// Backend Errors
// =============================================================================

/// Errors reported by storage backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Could not establish a connection to the store.
    #[error("connection failed: {url} - {reason}")]
    Connect {
        /// The location that failed to connect.
        url: String,
        /// Reason for failure.
        reason: String,
    },

    /// A request to the store failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A call did not finish within the configured timeout.
    #[error("operation on '{key}' timed out")]
    Timeout {
        /// The key being read or written.
        key: String,
    },

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entries could not be converted.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Raw content could not be decoded into the configuration type.
    #[error("failed to decode {source_name}: {reason}")]
    Decode {
        /// Where the content came from (path or key).
        source_name: String,
        /// Reason for failure.
        reason: String,
    },

    /// The configuration could not be encoded for storage.
    #[error("failed to encode {target}: {reason}")]
    Encode {
        /// Where the content was going (path or key).
        target: String,
        /// Reason for failure.
        reason: String,
    },

    /// The watch subscription could not be started or broke.
    #[error("watch error: {0}")]
    Watch(String),
}

impl BackendError {
    /// Creates a decode error.
    pub fn decode(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Decode {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates an encode error.
    pub fn encode(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Encode {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a connection error.
    pub fn connect(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connect {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for path resolution.
pub type PathResult<T> = Result<T, PathError>;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;
