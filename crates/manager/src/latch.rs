use std::time::Duration;

use keylock_store::{LockStore, Subscription};
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::Error;

/// Why a wait on a latch ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake {
    /// A release notification arrived.
    Notified,

    /// The bound elapsed first, possibly because a notification was lost.
    TimedOut,
}

/// Shared wait point for every local waiter on one contended key.
///
/// The subscription is created at most once per latch and dropped (which
/// unsubscribes) together with the latch.
pub struct Latch<T> {
    channel: String,
    subscription: OnceCell<Mutex<T>>,
}

impl<T: Subscription> Latch<T> {
    pub const fn new(channel: String) -> Self {
        Self {
            channel,
            subscription: OnceCell::const_new(),
        }
    }

    /// Subscribes to the release channel unless already subscribed.
    pub async fn subscribe<S>(&self, store: &S) -> Result<(), S::Error>
    where
        S: LockStore<Subscription = T>,
    {
        self.subscription
            .get_or_try_init(|| async {
                debug!(channel = %self.channel, "Subscribing latch");
                store.subscribe(&self.channel).await.map(Mutex::new)
            })
            .await?;

        Ok(())
    }

    #[cfg(test)]
    pub fn is_subscribed(&self) -> bool {
        self.subscription.initialized()
    }

    /// Waits for the next release notification, bounded by `limit`.
    ///
    /// Waiters queue on the latch's mutex so each notification is consumed
    /// by one of them; time spent queueing counts against `limit`.
    pub async fn wait_for_message(&self, limit: Duration) -> Result<Wake, Error<T::Error>> {
        let subscription = self.subscription.get().ok_or(Error::NotSubscribed)?;

        let waited = tokio::time::timeout(limit, async {
            let mut subscription = subscription.lock().await;
            subscription.next_message().await
        })
        .await;

        match waited {
            Ok(Ok(Some(_))) => Ok(Wake::Notified),
            Ok(Ok(None)) => Err(Error::SubscriptionClosed),
            Ok(Err(e)) => Err(Error::Store(e)),
            Err(_elapsed) => Ok(Wake::TimedOut),
        }
    }
}
