//! Error types for the remote cache client

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::sync::Arc;
use thiserror::Error;

/// Error type for remote cache operations
///
/// Lower layers propagate these faithfully; only the spawn cache mediator
/// turns them into misses or warnings.
#[derive(Error, Debug, Diagnostic)]
pub enum RemoteError {
    /// Could not establish the connection to the endpoint
    #[error("Failed to connect to {endpoint}: {message}")]
    #[diagnostic(
        code(stowage_remote::connection_failed),
        help("Check that the remote cache endpoint is reachable")
    )]
    ConnectionFailed {
        /// Endpoint that was dialed
        endpoint: String,
        /// Transport error message
        message: String,
    },

    /// A gRPC call returned a non-OK status
    #[error("{operation} failed: {source}")]
    #[diagnostic(code(stowage_remote::grpc_error))]
    GrpcError {
        /// RPC name, e.g. `ByteStream.Write`
        operation: String,
        /// Status returned by the server or the transport
        #[source]
        source: tonic::Status,
    },

    /// A single RPC attempt exceeded its local deadline
    #[error("{operation} timed out after {timeout_secs}s")]
    #[diagnostic(code(stowage_remote::timeout))]
    Timeout {
        /// RPC name
        operation: String,
        /// Deadline that elapsed
        timeout_secs: u64,
    },

    /// Local filesystem error
    #[error("I/O error during {context}: {source}")]
    #[diagnostic(code(stowage_remote::io))]
    IoError {
        /// What was being done
        context: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A referenced blob is not present in the CAS
    #[error("Blob {digest} not found in the remote cache")]
    #[diagnostic(
        code(stowage_remote::cache_not_found),
        help("The cache entry references content that has been evicted")
    )]
    CacheNotFound {
        /// `hash/size` of the missing blob
        digest: String,
    },

    /// A digest string or message could not be parsed
    #[error("Invalid digest: {0}")]
    #[diagnostic(code(stowage_remote::invalid_digest))]
    InvalidDigest(String),

    /// Downloaded content does not match the digest it was requested by
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    #[diagnostic(code(stowage_remote::digest_mismatch))]
    DigestMismatch {
        /// Requested digest
        expected: String,
        /// Digest of the received bytes
        actual: String,
    },

    /// The server committed a different number of bytes than were sent
    #[error("ByteStream transfer incomplete: expected {expected} bytes, got {actual}")]
    #[diagnostic(code(stowage_remote::bytestream_incomplete))]
    ByteStreamIncomplete {
        /// Expected size
        expected: i64,
        /// Size reported or received
        actual: i64,
    },

    /// The input tree could not be built
    #[error("Merkle tree error: {message}")]
    #[diagnostic(code(stowage_remote::merkle))]
    MerkleError {
        /// Description of the problem
        message: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    #[diagnostic(code(stowage_remote::config))]
    ConfigError(String),

    /// A protobuf or configuration document could not be decoded
    #[error("Serialization error: {message}")]
    #[diagnostic(code(stowage_remote::serialization))]
    SerializationError {
        /// Description of the problem
        message: String,
    },

    /// The retrier gave up
    #[error("{operation} failed after {attempts} attempts: {source}")]
    #[diagnostic(code(stowage_remote::retry_exhausted))]
    RetryExhausted {
        /// RPC name
        operation: String,
        /// Attempts made, including the first
        attempts: usize,
        /// The last error seen
        #[source]
        source: Box<RemoteError>,
    },

    /// The operation was cancelled by its owner
    #[error("Operation cancelled: {operation}")]
    #[diagnostic(code(stowage_remote::cancelled))]
    Cancelled {
        /// What was cancelled
        operation: String,
    },

    /// The shared channel was closed by its last holder
    #[error("Remote channel is closed")]
    #[diagnostic(code(stowage_remote::channel_closed))]
    ChannelClosed,

    /// A deduplicated upload failed; every waiter sees the same cause
    #[error("Upload of {digest} failed: {source}")]
    #[diagnostic(code(stowage_remote::upload_failed))]
    UploadFailed {
        /// `hash/size` of the blob
        digest: String,
        /// Shared failure of the single in-flight transfer
        #[source]
        source: Arc<RemoteError>,
    },
}

impl RemoteError {
    /// Create a connection failure
    pub fn connection_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a gRPC error
    pub fn grpc_error(operation: impl Into<String>, source: tonic::Status) -> Self {
        Self::GrpcError {
            operation: operation.into(),
            source,
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_secs,
        }
    }

    /// Create an I/O error with context
    pub fn io_error(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::IoError {
            context: context.into(),
            source,
        }
    }

    /// Create a cache-not-found error for a blob
    pub fn cache_not_found(digest: impl std::fmt::Display) -> Self {
        Self::CacheNotFound {
            digest: digest.to_string(),
        }
    }

    /// Create an invalid digest error
    pub fn invalid_digest(message: impl Into<String>) -> Self {
        Self::InvalidDigest(message.into())
    }

    /// Create a digest mismatch error
    pub fn digest_mismatch(
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create an incomplete transfer error
    pub fn bytestream_incomplete(expected: i64, actual: i64) -> Self {
        Self::ByteStreamIncomplete { expected, actual }
    }

    /// Create a Merkle tree error
    pub fn merkle_error(message: impl Into<String>) -> Self {
        Self::MerkleError {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Create a retry-exhausted error wrapping the last failure
    pub fn retry_exhausted(operation: impl Into<String>, attempts: usize, last: Self) -> Self {
        Self::RetryExhausted {
            operation: operation.into(),
            attempts,
            source: Box::new(last),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Whether this error means a referenced blob is gone from the CAS.
    ///
    /// Looks through retry and shared-upload wrappers.
    #[must_use]
    pub fn is_cache_not_found(&self) -> bool {
        match self {
            Self::CacheNotFound { .. } => true,
            Self::RetryExhausted { source, .. } => source.is_cache_not_found(),
            Self::UploadFailed { source, .. } => source.is_cache_not_found(),
            _ => false,
        }
    }

    /// Whether this error is a cancellation, looking through wrappers
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::RetryExhausted { source, .. } => source.is_cancelled(),
            Self::UploadFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<prost::DecodeError> for RemoteError {
    fn from(err: prost::DecodeError) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Result type for remote cache operations
pub type Result<T> = std::result::Result<T, RemoteError>;
