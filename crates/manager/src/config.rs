use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use keylock_store::{LockStoreError, MAX_LEASE};

use crate::Error;
use crate::token::{RandomTokens, TokenGenerator};

const DEFAULT_NUM_SHARDS: NonZeroUsize = NonZeroUsize::new(50).unwrap();
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timing parameters for one acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockTimings {
    /// Overall budget for waiting on a held lock. Zero means a single attempt
    /// plus one retry right after registering interest.
    pub wait: Duration,

    /// TTL set on the lock record. The holder must finish within it; leases
    /// are never renewed. At most `MAX_LEASE`.
    pub lease: Duration,

    /// Upper bound on a single wait for a release notification. Bounds the
    /// extra latency a lost notification can cause.
    pub poll_interval: Duration,
}

impl LockTimings {
    /// Defaults for `try_lock`: 500 ms wait, 10 s lease.
    pub const TRY_LOCK: Self = Self::new(Duration::from_millis(500), Duration::from_secs(10));

    /// Defaults for `with_lock`: 5 s wait, 20 s lease.
    pub const WITH_LOCK: Self = Self::new(Duration::from_secs(5), Duration::from_secs(20));

    /// Creates timings with the default 100 ms poll interval.
    #[must_use]
    pub const fn new(wait: Duration, lease: Duration) -> Self {
        Self {
            wait,
            lease,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Replaces the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub(crate) fn validate<E: LockStoreError>(&self) -> Result<(), Error<E>> {
        if self.lease.is_zero() {
            return Err(Error::InvalidLease);
        }

        if self.lease > MAX_LEASE {
            return Err(Error::LeaseTooLong { max: MAX_LEASE });
        }

        if self.poll_interval.is_zero() {
            return Err(Error::InvalidPollInterval);
        }

        Ok(())
    }
}

impl Default for LockTimings {
    fn default() -> Self {
        Self::TRY_LOCK
    }
}

/// Configuration for the `LockManager`.
#[derive(Clone, Debug)]
pub struct LockManagerConfig {
    /// Number of registry shards local waiters are spread across.
    pub num_shards: NonZeroUsize,

    /// Timings `try_lock` uses when the caller passes none.
    pub try_lock_timings: LockTimings,

    /// Timings `with_lock` uses when the caller passes none.
    pub with_lock_timings: LockTimings,

    /// Token source for `with_lock`.
    pub token_generator: Arc<dyn TokenGenerator>,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            num_shards: DEFAULT_NUM_SHARDS,
            try_lock_timings: LockTimings::TRY_LOCK,
            with_lock_timings: LockTimings::WITH_LOCK,
            token_generator: Arc::new(RandomTokens::new()),
        }
    }
}

impl LockManagerConfig {
    /// Sets the shard count.
    #[must_use]
    pub fn with_num_shards(mut self, num_shards: NonZeroUsize) -> Self {
        self.num_shards = num_shards;
        self
    }

    /// Sets the default `try_lock` timings.
    #[must_use]
    pub fn with_try_lock_timings(mut self, timings: LockTimings) -> Self {
        self.try_lock_timings = timings;
        self
    }

    /// Sets the default `with_lock` timings.
    #[must_use]
    pub fn with_with_lock_timings(mut self, timings: LockTimings) -> Self {
        self.with_lock_timings = timings;
        self
    }

    /// Sets the token source used by `with_lock`.
    #[must_use]
    pub fn with_token_generator<G: TokenGenerator>(mut self, generator: G) -> Self {
        self.token_generator = Arc::new(generator);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LockManagerConfig::default();

        assert_eq!(config.num_shards.get(), 50);
        assert_eq!(config.try_lock_timings.wait, Duration::from_millis(500));
        assert_eq!(config.try_lock_timings.lease, Duration::from_millis(10000));
        assert_eq!(config.with_lock_timings.wait, Duration::from_millis(5000));
        assert_eq!(config.with_lock_timings.lease, Duration::from_millis(20000));
        assert_eq!(
            config.with_lock_timings.poll_interval,
            Duration::from_millis(100)
        );
        assert_eq!(LockTimings::default(), LockTimings::TRY_LOCK);
    }
}
