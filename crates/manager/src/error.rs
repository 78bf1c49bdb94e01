use std::time::Duration;

use keylock_store::LockStoreError;
use thiserror::Error;

/// Errors that can occur when using the lock manager.
///
/// Failing to acquire within the wait budget and releasing a lock the caller
/// does not hold are normal outcomes, not errors.
#[derive(Debug, Error)]
pub enum Error<E: LockStoreError> {
    /// A zero lease was requested.
    #[error("lease must be greater than zero")]
    InvalidLease,

    /// The requested lease exceeds what stores honour.
    #[error("lease must not exceed {max:?}")]
    LeaseTooLong {
        /// The longest accepted lease.
        max: Duration,
    },

    /// A zero poll interval was requested.
    #[error("poll interval must be greater than zero")]
    InvalidPollInterval,

    /// A latch was waited on before it subscribed to its release channel.
    #[error("latch is not subscribed to its release channel")]
    NotSubscribed,

    /// The release channel closed while waiting, so the store connection is gone.
    #[error("release channel closed while waiting")]
    SubscriptionClosed,

    /// The store failed.
    #[error(transparent)]
    Store(E),
}
