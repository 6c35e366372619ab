//! Error types for the bufcache buffer cache.

use std::fmt;

/// The result type used throughout bufcache.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for buffer cache operations.
///
/// Note that contract violations (for example calling `write` or `release`
/// on a buffer whose content lock the caller does not hold) are *not*
/// represented here. Those indicate a caller bug and cause an immediate
/// panic with a diagnostic naming the violated contract.
#[derive(Debug)]
pub enum Error {
    /// Every buffer in the cache is currently referenced; the request
    /// cannot be satisfied until a holder releases or unpins a buffer.
    CacheExhausted {
        /// Total number of buffer slots in the cache.
        capacity: usize,
    },

    /// An invalid argument was provided.
    InvalidArgument(String),
}

impl Error {
    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CacheExhausted { capacity } => {
                write!(f, "Cache exhausted: all {} buffers are referenced", capacity)
            }
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::CacheExhausted { capacity: 30 };
        assert_eq!(err.to_string(), "Cache exhausted: all 30 buffers are referenced");

        let err = Error::invalid_argument("capacity must be non-zero");
        assert_eq!(err.to_string(), "Invalid argument: capacity must be non-zero");
    }

    #[test]
    fn test_error_is_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&Error::CacheExhausted { capacity: 1 });
    }
}
