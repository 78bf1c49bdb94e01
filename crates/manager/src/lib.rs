//! Distributed mutual-exclusion locks keyed by an arbitrary identifier.
//!
//! Ownership lives in a shared store (see `keylock-store`); this crate adds
//! the local coordination that keeps store traffic down when many local
//! callers contend for the same key. Callers waiting on one key share a
//! single latch and a single release-channel subscription, and poll on a
//! bounded interval so a lost release notification only costs latency.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
mod latch;
mod registry;
mod token;

pub use config::{LockManagerConfig, LockTimings};
pub use error::Error;
pub use keylock_store::{LockStore, MAX_LEASE, OwnerToken};
pub use token::{RandomTokens, SequentialTokens, TokenGenerator};

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use keylock_store::AcquireOutcome;
use latch::Latch;
use registry::Registry;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// Payload published on a key's channel after a successful release.
pub const RELEASED_PAYLOAD: &[u8] = b"released";

/// Store key of the lock record for `resource_id`.
#[must_use]
pub fn record_key(resource_id: &str) -> String {
    format!("lock:{resource_id}")
}

/// Release notification channel for `resource_id`.
#[must_use]
pub fn channel_name(resource_id: &str) -> String {
    format!("lock_channel:{resource_id}")
}

/// Represents the current status of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// The lock is free.
    Free,

    /// The lock is held under a different token.
    HeldByOther(OwnerToken),

    /// The lock is held under the token that was asked about.
    HeldBySelf,
}

/// Lock manager over a shared `LockStore`.
///
/// Clones share the store connections and the local waiter registry.
pub struct LockManager<S: LockStore> {
    store: S,
    registry: Arc<Registry<Latch<S::Subscription>>>,
    config: LockManagerConfig,
}

impl<S: LockStore> Clone for LockManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
        }
    }
}

impl<S: LockStore> fmt::Debug for LockManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("config", &self.config)
            .field("contended_keys", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl<S: LockStore> LockManager<S> {
    /// Creates a manager over an already connected store.
    #[must_use]
    pub fn new(store: S, config: LockManagerConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new(config.num_shards)),
            store,
            config,
        }
    }

    /// The underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Number of keys that currently have local waiters.
    #[must_use]
    pub fn contended_keys(&self) -> usize {
        self.registry.len()
    }

    async fn attempt(
        &self,
        key: &str,
        token: OwnerToken,
        timings: &LockTimings,
    ) -> Result<bool, Error<S::Error>> {
        match self
            .store
            .acquire(key, token, timings.lease)
            .await
            .map_err(Error::Store)?
        {
            AcquireOutcome::Acquired => Ok(true),
            AcquireOutcome::Held { remaining } => {
                debug!(?remaining, "Lock held by another owner");
                Ok(false)
            }
        }
    }

    /// Attempts to acquire the lock on `resource_id` with `token`, waiting up
    /// to the wait budget for the current holder to release it.
    ///
    /// Returns `Ok(false)` when the budget runs out. Re-acquiring with the
    /// token that already holds the lock succeeds without extending its lease.
    /// Uses the configured `try_lock` timings when `timings` is `None`.
    ///
    /// # Errors
    ///
    /// Returns a usage error for a zero lease or poll interval, and
    /// `Error::Store` / `Error::SubscriptionClosed` if the store fails.
    #[instrument(skip(self, token, timings), fields(token = %token))]
    pub async fn try_lock(
        &self,
        resource_id: &str,
        token: OwnerToken,
        timings: Option<LockTimings>,
    ) -> Result<bool, Error<S::Error>> {
        let timings = timings.unwrap_or(self.config.try_lock_timings);
        timings.validate::<S::Error>()?;

        let started = Instant::now();
        let key = record_key(resource_id);

        if self.attempt(&key, token, &timings).await? {
            debug!("Lock acquired on first attempt");
            return Ok(true);
        }

        // Withdrawn on every exit path, including cancellation.
        let interest = self
            .registry
            .register(resource_id, || Latch::new(channel_name(resource_id)));
        let latch = interest.latch();

        latch.subscribe(&self.store).await.map_err(Error::Store)?;

        // The holder may have released before the subscription was live.
        if self.attempt(&key, token, &timings).await? {
            debug!("Lock acquired after subscribing");
            return Ok(true);
        }

        loop {
            let remaining = timings.wait.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }

            let wake = latch
                .wait_for_message(remaining.min(timings.poll_interval))
                .await?;
            trace!(?wake, "Retrying lock");

            if self.attempt(&key, token, &timings).await? {
                info!(waited = ?started.elapsed(), "Lock acquired after waiting");
                return Ok(true);
            }
        }

        debug!(wait = ?timings.wait, "Wait budget exhausted");
        Ok(false)
    }

    /// Releases the lock on `resource_id` if `token` still holds it, then
    /// notifies waiters.
    ///
    /// Returns whether a record was removed. A token that does not hold the
    /// lock (never did, or its lease expired) is a silent no-op. A failed
    /// notification is only logged: waiters fall back to polling.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the release itself fails.
    #[instrument(skip(self, token), fields(token = %token))]
    pub async fn unlock(&self, resource_id: &str, token: OwnerToken) -> Result<bool, Error<S::Error>> {
        let released = self
            .store
            .release(&record_key(resource_id), token)
            .await
            .map_err(Error::Store)?;

        if !released {
            debug!("Release skipped; token does not hold the lock");
            return Ok(false);
        }

        if let Err(e) = self
            .store
            .publish(&channel_name(resource_id), Bytes::from_static(RELEASED_PAYLOAD))
            .await
        {
            warn!(error = ?e, "Failed to publish release notification");
        }

        debug!("Lock released");
        Ok(true)
    }

    /// Runs `work` while holding the lock on `resource_id` under a fresh token.
    ///
    /// Returns `Ok(None)` without running `work` if the lock could not be
    /// acquired; what that means is up to the caller. The lock is released
    /// after `work` finishes, and also if it panics (the panic then resumes).
    /// Uses the configured `with_lock` timings when `timings` is `None`.
    ///
    /// The lease is not renewed while `work` runs. If `work` outlives the
    /// lease, another owner can acquire the lock before it finishes, and the
    /// release afterwards is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates errors from `try_lock` and from the release.
    pub async fn with_lock<F, Fut, T>(
        &self,
        resource_id: &str,
        timings: Option<LockTimings>,
        work: F,
    ) -> Result<Option<T>, Error<S::Error>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let timings = timings.unwrap_or(self.config.with_lock_timings);
        let token = self.config.token_generator.next_token();

        if !self.try_lock(resource_id, token, Some(timings)).await? {
            debug!(resource_id, "Could not acquire lock; skipping work");
            return Ok(None);
        }

        let outcome = AssertUnwindSafe(work()).catch_unwind().await;
        let released = self.unlock(resource_id, token).await;

        let value = match outcome {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        released?;

        Ok(Some(value))
    }

    /// Checks who holds the lock on `resource_id`, relative to `token`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the read fails.
    pub async fn check(
        &self,
        resource_id: &str,
        token: OwnerToken,
    ) -> Result<LockStatus, Error<S::Error>> {
        let owner = self
            .store
            .owner(&record_key(resource_id))
            .await
            .map_err(Error::Store)?;

        Ok(match owner {
            None => LockStatus::Free,
            Some(owner) if owner == token => LockStatus::HeldBySelf,
            Some(owner) => LockStatus::HeldByOther(owner),
        })
    }

    /// Closes the store connections. In-flight and later operations fail.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if closing fails.
    pub async fn shutdown(&self) -> Result<(), Error<S::Error>> {
        info!("Shutting down lock manager");
        self.store.close().await.map_err(Error::Store)
    }
}
