//! Error types for resmgr.

use crate::caps::ResourceType;
use crate::manager::RequestId;
use thiserror::Error;

/// Result type alias using resmgr's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for resource manager operations.
///
/// The `Display` output is the human-readable diagnostic for the failure.
#[derive(Error, Debug)]
pub enum Error {
    /// The shared segment could not be resolved, created or mapped.
    #[error("shared segment unavailable: {0}")]
    SegmentUnavailable(String),

    /// A config source could not be parsed.
    #[error("config error: {0}")]
    Config(String),

    /// The request carried no notification callback.
    #[error("request has no notification callback")]
    NoCallback,

    /// The request's resource type does not match the call's resource type.
    #[error("resource type mismatch: call is for {expected}, request is for {actual}")]
    TypeMismatch {
        /// Type named by the call.
        expected: ResourceType,
        /// Type carried by the request.
        actual: ResourceType,
    },

    /// A query named an index outside the configured table.
    #[error("no {resource_type} at index {index}")]
    InvalidIndex {
        /// Resource type queried.
        resource_type: ResourceType,
        /// Index queried.
        index: usize,
    },

    /// No ownership or pending request of this handle carries the id.
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),

    /// The request could not be granted or queued.
    #[error("request denied: {0}")]
    Denied(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
