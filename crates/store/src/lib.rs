//! Abstract interface for the shared key-value store backing keyed locks.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::{self, Debug, Display};
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Longest lease a store honours. Longer leases are clamped to it.
pub const MAX_LEASE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Marker trait for `LockStore` errors
pub trait LockStoreError: Debug + Error + Send + Sync + 'static {}

/// Opaque value proving authorship of one particular acquisition.
///
/// Stored in the lock record as its decimal string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerToken(u64);

impl OwnerToken {
    /// Wraps a raw token value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw token value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for OwnerToken {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A lock record held a value that is not an owner token.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("malformed owner token '{value}': {source}")]
pub struct TokenParseError {
    value: String,
    source: ParseIntError,
}

impl FromStr for OwnerToken {
    type Err = TokenParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self).map_err(|source| TokenParseError {
            value: s.to_string(),
            source,
        })
    }
}

impl TryFrom<&[u8]> for OwnerToken {
    type Error = TokenParseError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        String::from_utf8_lossy(bytes).parse()
    }
}

/// Result of a single atomic acquire attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The record now carries the caller's token.
    Acquired,

    /// Another token holds the record.
    Held {
        /// Remaining lease of the current record, if the store could report one.
        remaining: Option<Duration>,
    },
}

impl AcquireOutcome {
    /// Whether the attempt took (or already had) the lock.
    #[must_use]
    pub const fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired)
    }
}

/// A live subscription to one notification channel.
///
/// Dropping the subscription unsubscribes from the channel.
#[async_trait]
pub trait Subscription: Send + 'static {
    /// The error type for subscription operations.
    type Error: LockStoreError;

    /// Waits for the next message published on the channel.
    ///
    /// Returns `Ok(None)` once the underlying connection is gone and no
    /// further messages can arrive.
    async fn next_message(&mut self) -> Result<Option<Bytes>, Self::Error>;
}

/// A shared key-value store offering the primitives a keyed lock needs.
///
/// Both `acquire` and `release` must execute as one indivisible step on the
/// store side; publish/subscribe is best effort with no persistence of
/// missed messages.
#[async_trait]
pub trait LockStore: Clone + Send + Sync + 'static {
    /// The error type for store operations.
    type Error: LockStoreError;

    /// The subscription handle returned by `subscribe`.
    type Subscription: Subscription<Error = Self::Error>;

    /// Creates the record with `token` and a `lease` TTL if no record exists.
    ///
    /// Reports `Acquired` when the record was created or already carries
    /// `token`; an existing record's lease is never extended. A `lease`
    /// above `MAX_LEASE` is clamped to it.
    async fn acquire(
        &self,
        key: &str,
        token: OwnerToken,
        lease: Duration,
    ) -> Result<AcquireOutcome, Self::Error>;

    /// Deletes the record iff its value equals `token`.
    ///
    /// Returns whether a record was deleted.
    async fn release(&self, key: &str, token: OwnerToken) -> Result<bool, Self::Error>;

    /// Reads the token currently stored under `key`.
    async fn owner(&self, key: &str) -> Result<Option<OwnerToken>, Self::Error>;

    /// Publishes `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), Self::Error>;

    /// Subscribes to `channel`, returning once the subscription is active.
    async fn subscribe(&self, channel: &str) -> Result<Self::Subscription, Self::Error>;

    /// Closes the store's connections. Later operations fail.
    async fn close(&self) -> Result<(), Self::Error>;
}
