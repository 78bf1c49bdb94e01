//! In-memory (single node) implementation of the lock store for local
//! development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use keylock_store::{AcquireOutcome, LockStore, MAX_LEASE, OwnerToken, Subscription};
use tokio::sync::broadcast::error::RecvError;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug)]
struct Record {
    token: OwnerToken,
    expires_at: Instant,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: Mutex<HashMap<String, Record>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    drop_notifications: AtomicBool,
    closed: AtomicBool,
}

/// In-memory lock store.
///
/// Records expire lazily: an expired record is treated as absent by every
/// operation. Time is read from tokio's clock, so a paused test runtime
/// controls lease expiry.
#[derive(Clone, Debug, Default)]
pub struct MemoryLockStore {
    inner: Arc<Inner>,
}

impl MemoryLockStore {
    /// Creates a new `MemoryLockStore`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Silently discards every published message while `drop` is set,
    /// simulating lost pub/sub notifications.
    pub fn drop_notifications(&self, drop: bool) {
        self.inner.drop_notifications.store(drop, Ordering::SeqCst);
    }

    /// Remaining lease of the live record under `key`.
    #[must_use]
    pub fn remaining_lease(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let records = self.inner.records.lock();

        records
            .get(key)
            .filter(|record| record.is_live(now))
            .map(|record| record.expires_at - now)
    }

    /// Number of channels with at least one registered subscriber.
    #[must_use]
    pub fn subscribed_channels(&self) -> usize {
        let channels = self.inner.channels.lock();

        channels
            .values()
            .filter(|sender| sender.receiver_count() > 0)
            .count()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        Ok(())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    type Error = Error;
    type Subscription = MemorySubscription;

    async fn acquire(
        &self,
        key: &str,
        token: OwnerToken,
        lease: Duration,
    ) -> Result<AcquireOutcome, Self::Error> {
        self.ensure_open()?;

        let now = Instant::now();
        let mut records = self.inner.records.lock();

        match records.get(key) {
            Some(record) if record.is_live(now) => {
                if record.token == token {
                    Ok(AcquireOutcome::Acquired)
                } else {
                    Ok(AcquireOutcome::Held {
                        remaining: Some(record.expires_at - now),
                    })
                }
            }
            _ => {
                records.insert(
                    key.to_string(),
                    Record {
                        token,
                        expires_at: now + lease.min(MAX_LEASE),
                    },
                );

                Ok(AcquireOutcome::Acquired)
            }
        }
    }

    async fn release(&self, key: &str, token: OwnerToken) -> Result<bool, Self::Error> {
        self.ensure_open()?;

        let now = Instant::now();
        let mut records = self.inner.records.lock();

        match records.get(key) {
            Some(record) if record.is_live(now) && record.token == token => {
                records.remove(key);
                Ok(true)
            }
            Some(record) if !record.is_live(now) => {
                records.remove(key);
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    async fn owner(&self, key: &str) -> Result<Option<OwnerToken>, Self::Error> {
        self.ensure_open()?;

        let now = Instant::now();
        let records = self.inner.records.lock();

        Ok(records
            .get(key)
            .filter(|record| record.is_live(now))
            .map(|record| record.token))
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), Self::Error> {
        self.ensure_open()?;

        if self.inner.drop_notifications.load(Ordering::SeqCst) {
            debug!(channel, "Dropping notification");
            return Ok(());
        }

        let mut channels = self.inner.channels.lock();

        let undeliverable = channels
            .get(channel)
            .is_some_and(|sender| sender.send(payload).is_err());

        // No receivers left on this channel.
        if undeliverable {
            channels.remove(channel);
        }

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Self::Subscription, Self::Error> {
        self.ensure_open()?;

        let mut channels = self.inner.channels.lock();
        let receiver = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        Ok(MemorySubscription {
            channel: channel.to_string(),
            receiver,
            inner: Arc::clone(&self.inner),
        })
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.inner.closed.store(true, Ordering::SeqCst);

        // Dropping the senders ends every live subscription.
        self.inner.channels.lock().clear();

        Ok(())
    }
}

/// Subscription to one channel of a `MemoryLockStore`.
///
/// Dropping the last subscription to a channel removes the channel.
#[derive(Debug)]
pub struct MemorySubscription {
    channel: String,
    receiver: broadcast::Receiver<Bytes>,
    inner: Arc<Inner>,
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let mut channels = self.inner.channels.lock();

        // Our own receiver still counts here.
        let last = channels
            .get(&self.channel)
            .is_some_and(|sender| sender.receiver_count() <= 1);

        if last {
            channels.remove(&self.channel);
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    type Error = Error;

    async fn next_message(&mut self) -> Result<Option<Bytes>, Self::Error> {
        match self.receiver.recv().await {
            Ok(payload) => Ok(Some(payload)),
            Err(RecvError::Lagged(skipped)) => {
                warn!(channel = %self.channel, skipped, "Subscription lagged behind publisher");
                Ok(Some(Bytes::new()))
            }
            Err(RecvError::Closed) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::time::timeout;
    use uuid::Uuid;

    fn unique_key() -> String {
        format!("lock:{}", Uuid::new_v4().as_hyphenated())
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_reports_remaining_lease_when_held() {
        let store = MemoryLockStore::new();
        let key = unique_key();

        let first = store
            .acquire(&key, OwnerToken::new(1), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(first, AcquireOutcome::Acquired);

        tokio::time::advance(Duration::from_secs(4)).await;

        let second = store
            .acquire(&key, OwnerToken::new(2), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(
            second,
            AcquireOutcome::Held {
                remaining: Some(Duration::from_secs(6))
            }
        );
        assert_eq!(store.owner(&key).await.unwrap(), Some(OwnerToken::new(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_token_reacquire_does_not_extend_lease() {
        let store = MemoryLockStore::new();
        let key = unique_key();
        let token = OwnerToken::new(7);

        store
            .acquire(&key, token, Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        let again = store
            .acquire(&key, token, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(again, AcquireOutcome::Acquired);
        assert_eq!(
            store.remaining_lease(&key),
            Some(Duration::from_secs(7))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_can_be_taken_over() {
        let store = MemoryLockStore::new();
        let key = unique_key();

        store
            .acquire(&key, OwnerToken::new(1), Duration::from_millis(100))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(101)).await;

        assert_eq!(store.owner(&key).await.unwrap(), None);

        let outcome = store
            .acquire(&key, OwnerToken::new(2), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(outcome, AcquireOutcome::Acquired);

        // The first owner's lease is gone; its release must not touch the new record.
        assert!(!store.release(&key, OwnerToken::new(1)).await.unwrap());
        assert_eq!(store.owner(&key).await.unwrap(), Some(OwnerToken::new(2)));
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let store = MemoryLockStore::new();
        let key = unique_key();

        store
            .acquire(&key, OwnerToken::new(1), Duration::from_secs(10))
            .await
            .unwrap();

        assert!(!store.release(&key, OwnerToken::new(2)).await.unwrap());
        assert_eq!(store.owner(&key).await.unwrap(), Some(OwnerToken::new(1)));

        assert!(store.release(&key, OwnerToken::new(1)).await.unwrap());
        assert_eq!(store.owner(&key).await.unwrap(), None);

        assert!(!store.release(&key, OwnerToken::new(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let store = MemoryLockStore::new();
        let mut subscription = store.subscribe("lock_channel:1").await.unwrap();

        store
            .publish("lock_channel:1", Bytes::from_static(b"released"))
            .await
            .unwrap();
        store
            .publish("lock_channel:2", Bytes::from_static(b"other"))
            .await
            .unwrap();

        let message = timeout(Duration::from_secs(1), subscription.next_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, Some(Bytes::from_static(b"released")));

        let nothing = timeout(Duration::from_millis(50), subscription.next_message()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_notifications_never_arrive() {
        let store = MemoryLockStore::new();
        let mut subscription = store.subscribe("lock_channel:1").await.unwrap();

        store.drop_notifications(true);
        store
            .publish("lock_channel:1", Bytes::from_static(b"released"))
            .await
            .unwrap();

        let result = timeout(Duration::from_millis(500), subscription.next_message()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_subscription_drop_releases_channel() {
        let store = MemoryLockStore::new();

        let subscription = store.subscribe("lock_channel:9").await.unwrap();
        assert_eq!(store.subscribed_channels(), 1);

        drop(subscription);
        assert_eq!(store.subscribed_channels(), 0);
    }

    #[tokio::test]
    async fn test_last_subscription_drop_removes_channel() {
        let store = MemoryLockStore::new();

        for index in 0..1000 {
            let subscription = store
                .subscribe(&format!("lock_channel:{index}"))
                .await
                .unwrap();
            drop(subscription);
        }

        assert_eq!(store.subscribed_channels(), 0);
        assert!(store.inner.channels.lock().is_empty());

        let first = store.subscribe("lock_channel:shared").await.unwrap();
        let second = store.subscribe("lock_channel:shared").await.unwrap();

        drop(first);
        assert_eq!(store.inner.channels.lock().len(), 1);
        assert_eq!(store.subscribed_channels(), 1);

        drop(second);
        assert!(store.inner.channels.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_lease_is_clamped() {
        let store = MemoryLockStore::new();
        let key = unique_key();

        let outcome = store
            .acquire(&key, OwnerToken::new(1), Duration::MAX)
            .await
            .unwrap();

        assert_eq!(outcome, AcquireOutcome::Acquired);
        assert_eq!(store.remaining_lease(&key), Some(MAX_LEASE));
        assert_eq!(store.owner(&key).await.unwrap(), Some(OwnerToken::new(1)));
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions_and_rejects_operations() {
        let store = MemoryLockStore::new();
        let mut subscription = store.subscribe("lock_channel:1").await.unwrap();

        store.close().await.unwrap();

        assert_matches!(subscription.next_message().await, Ok(None));
        assert_matches!(
            store
                .acquire("lock:1", OwnerToken::new(1), Duration::from_secs(1))
                .await,
            Err(Error::Closed)
        );
        assert_matches!(store.owner("lock:1").await, Err(Error::Closed));
    }
}
