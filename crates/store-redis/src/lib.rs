//! Implementation of the lock store on Redis.
//!
//! The two atomic primitives run as Lua scripts on the server. Notifications
//! use a dedicated pub/sub connection whose messages are fanned out locally,
//! so any number of local subscriptions to one channel cost a single Redis
//! subscription.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
mod pubsub;

pub use config::{DEFAULT_HOST, DEFAULT_PORT, HOST_ENV, PORT_ENV, RedisLockStoreConfig};
pub use error::Error;
pub use pubsub::RedisSubscription;

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use keylock_store::{AcquireOutcome, LockStore, MAX_LEASE, OwnerToken};
use parking_lot::RwLock;
use pubsub::Command;
use redis::Script;
use redis::aio::MultiplexedConnection;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

// Succeeds when the record is ours after the set-if-absent, which also
// covers a caller re-acquiring with the token it already holds.
static ACQUIRE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('set', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
            return nil
        end
        if redis.call('get', KEYS[1]) == ARGV[1] then
            return nil
        end
        return redis.call('pttl', KEYS[1])
        ",
    )
});

static RELEASE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('get', KEYS[1]) == ARGV[1] then
            return redis.call('del', KEYS[1])
        end
        return 0
        ",
    )
});

struct Inner {
    connection: RwLock<Option<MultiplexedConnection>>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

/// A lock store backed by a single Redis server.
///
/// Holds one multiplexed connection for data commands and one pub/sub
/// connection. Neither is pooled or reconnected: once either is lost, the
/// affected operations fail.
#[derive(Clone)]
pub struct RedisLockStore {
    inner: Arc<Inner>,
}

impl RedisLockStore {
    /// Opens the data and pub/sub connections.
    ///
    /// Must be called from within a tokio runtime; the pub/sub dispatcher
    /// runs as a spawned task until `close` is called.
    ///
    /// # Errors
    ///
    /// Returns `Error::Redis` if either connection cannot be established.
    pub async fn connect(config: &RedisLockStoreConfig) -> Result<Self, Error> {
        let client = redis::Client::open(config.url())?;

        let connection = client.get_multiplexed_async_connection().await?;
        let (sink, stream) = client.get_async_pubsub().await?.split();

        let (commands, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(pubsub::run_dispatcher(
            sink,
            stream,
            receiver,
            shutdown.clone(),
        ));

        info!(host = %config.host, port = config.port, "Connected to redis");

        Ok(Self {
            inner: Arc::new(Inner {
                connection: RwLock::new(Some(connection)),
                commands,
                shutdown,
            }),
        })
    }

    fn connection(&self) -> Result<MultiplexedConnection, Error> {
        self.inner.connection.read().clone().ok_or(Error::Closed)
    }
}

impl std::fmt::Debug for RedisLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockStore")
            .field("closed", &self.inner.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn lease_millis(lease: Duration) -> u64 {
    // PX rejects zero, so sub-millisecond leases round up.
    u64::try_from(lease.min(MAX_LEASE).as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}

#[async_trait]
impl LockStore for RedisLockStore {
    type Error = Error;
    type Subscription = RedisSubscription;

    #[instrument(skip(self), fields(token = %token))]
    async fn acquire(
        &self,
        key: &str,
        token: OwnerToken,
        lease: Duration,
    ) -> Result<AcquireOutcome, Self::Error> {
        let mut connection = self.connection()?;

        let ttl: Option<i64> = ACQUIRE_SCRIPT
            .key(key)
            .arg(token.to_string())
            .arg(lease_millis(lease))
            .invoke_async(&mut connection)
            .await?;

        Ok(ttl.map_or(AcquireOutcome::Acquired, |ttl| AcquireOutcome::Held {
            // PTTL reports -2 for a vanished key and -1 for one without expiry.
            remaining: u64::try_from(ttl).ok().map(Duration::from_millis),
        }))
    }

    #[instrument(skip(self), fields(token = %token))]
    async fn release(&self, key: &str, token: OwnerToken) -> Result<bool, Self::Error> {
        let mut connection = self.connection()?;

        let deleted: i64 = RELEASE_SCRIPT
            .key(key)
            .arg(token.to_string())
            .invoke_async(&mut connection)
            .await?;

        Ok(deleted > 0)
    }

    async fn owner(&self, key: &str) -> Result<Option<OwnerToken>, Self::Error> {
        let mut connection = self.connection()?;

        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await?;

        Ok(value.map(|value| value.parse()).transpose()?)
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), Self::Error> {
        let mut connection = self.connection()?;

        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload.as_ref())
            .query_async(&mut connection)
            .await?;

        debug!(channel, receivers, "Published");

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Self::Subscription, Self::Error> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        let (reply, response) = oneshot::channel();

        self.inner
            .commands
            .send(Command::Subscribe {
                channel: channel.to_string(),
                reply,
            })
            .map_err(|_| Error::Closed)?;

        let receiver = response.await.map_err(|_| Error::Closed)??;

        Ok(RedisSubscription::new(
            channel.to_string(),
            receiver,
            self.inner.commands.clone(),
        ))
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.inner.shutdown.cancel();
        self.inner.connection.write().take();

        info!("Closed redis connections");

        Ok(())
    }
}
