use std::num::ParseIntError;

use keylock_store::{LockStoreError, TokenParseError};
use thiserror::Error;

/// Errors that can occur when using the Redis lock store.
#[derive(Debug, Error)]
pub enum Error {
    /// The store was closed, or its pub/sub connection went away.
    #[error("redis lock store is closed")]
    Closed,

    /// The configured port is not a valid port number.
    #[error("invalid redis port '{value}': {source}")]
    InvalidPort {
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        source: ParseIntError,
    },

    /// A lock record held something other than an owner token.
    #[error(transparent)]
    MalformedToken(#[from] TokenParseError),

    /// Error returned by the Redis client or server.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl LockStoreError for Error {}
