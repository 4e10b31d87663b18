//! Error types for tiercache

use std::sync::Arc;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a storage driver call that did not produce a value.
///
/// Success is always `Ok(..)`; this enum only carries the three failure
/// classes a caller can route on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Key is absent on the backend
    #[error("key not found")]
    NotFound,

    /// A local or remote rate limit refused the request
    #[error("operation throttled")]
    Throttled,

    /// The backend failed: network, auth, or an unexpected response
    #[error("backend dead: {0}")]
    Dead(String),
}

impl DriverError {
    /// Build a `Dead` error from anything displayable.
    pub fn dead(reason: impl std::fmt::Display) -> Self {
        DriverError::Dead(reason.to_string())
    }

    /// True for failures that should make a router try another node.
    pub fn is_failover(&self) -> bool {
        matches!(self, DriverError::Throttled | DriverError::Dead(_))
    }
}

/// Errors that can occur in tiercache
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage driver error
    #[error("storage driver error: {0}")]
    Driver(#[from] DriverError),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Malformed token bucket specification
    #[error("Invalid throttle specification {0:?}, expected <speed>x<timeout>/<max>")]
    InvalidThrottle(String),

    // =========================================================================
    // Disk Cache Errors
    // =========================================================================
    /// Populate callback failed for a key
    #[error("Populate failed for key {key}: {source}")]
    Populate {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Key cannot be mapped to a cache file name
    #[error("Invalid cache key {0:?}")]
    InvalidKey(String),

    /// One outcome shared by every caller of a deduplicated operation
    #[error("{0}")]
    Shared(Arc<Error>),

    /// Operation on a cache file handle that was already closed
    #[error("cache file already closed")]
    Closed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Strip any `Shared` wrappers and return the underlying error.
    pub fn root(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// True if the root cause is a driver `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::Driver(DriverError::NotFound))
    }
}
