//! CLI binary to exercise keyed locks against a Redis server.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use keylock::{LockManager, LockManagerConfig, LockStatus, LockStore, LockTimings, OwnerToken};
use keylock_store_redis::{
    DEFAULT_HOST, DEFAULT_PORT, HOST_ENV, PORT_ENV, RedisLockStore, RedisLockStoreConfig,
};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::info;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shard count must be positive
    #[error("shard count must be greater than zero")]
    InvalidShards,

    /// A contending task panicked or was aborted
    #[error("contender failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Lock manager error
    #[error(transparent)]
    Lock(#[from] keylock::Error<keylock_store_redis::Error>),

    /// Store connection error
    #[error(transparent)]
    Store(#[from] keylock_store_redis::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Redis host
    #[arg(long, default_value = DEFAULT_HOST, env = HOST_ENV)]
    redis_host: String,

    /// Redis port
    #[arg(long, default_value_t = DEFAULT_PORT, env = PORT_ENV)]
    redis_port: u16,

    /// Number of shards local waiters are spread across
    #[arg(long, default_value_t = 50)]
    shards: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Races several callers for one key and reports how many got it
    Contend {
        /// Resource identifier to contend for
        #[arg(long, default_value = "7")]
        resource_id: String,

        /// Number of concurrent callers
        #[arg(long, default_value_t = 10)]
        callers: u64,

        /// Wait budget per caller in milliseconds
        #[arg(long, default_value_t = 10_000)]
        wait_ms: u64,

        /// Lease per acquisition in milliseconds
        #[arg(long, default_value_t = 10_000)]
        lease_ms: u64,

        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 100)]
        poll_ms: u64,

        /// How long each winner holds the lock in milliseconds
        #[arg(long, default_value_t = 10)]
        hold_ms: u64,
    },

    /// Shows who holds the lock on a resource
    Status {
        /// Resource identifier
        resource_id: String,

        /// Token to compare the holder against
        #[arg(long)]
        token: Option<u64>,
    },

    /// Releases a lock held under a token
    Release {
        /// Resource identifier
        resource_id: String,

        /// Token the lock was acquired with
        token: u64,
    },
}

async fn hold_lock(
    manager: &LockManager<RedisLockStore>,
    resource_id: &str,
    token: OwnerToken,
    timings: LockTimings,
    hold: Duration,
) -> Result<bool, Error> {
    if !manager.try_lock(resource_id, token, Some(timings)).await? {
        info!(%token, "Gave up waiting for lock");
        return Ok(false);
    }

    info!(%token, "Holding lock");
    tokio::time::sleep(hold).await;
    manager.unlock(resource_id, token).await?;

    Ok(true)
}

async fn contend(
    manager: &LockManager<RedisLockStore>,
    resource_id: &str,
    callers: u64,
    timings: LockTimings,
    hold: Duration,
) -> Result<(), Error> {
    let started = Instant::now();
    let acquired = Arc::new(AtomicUsize::new(0));
    let mut contenders = JoinSet::new();

    for caller in 1..=callers {
        let manager = manager.clone();
        let resource_id = resource_id.to_string();
        let acquired = Arc::clone(&acquired);

        contenders.spawn(async move {
            let token = OwnerToken::new(caller);
            let won = hold_lock(&manager, &resource_id, token, timings, hold).await;
            if matches!(won, Ok(true)) {
                acquired.fetch_add(1, Ordering::Relaxed);
            }

            won.map(|_| ())
        });
    }

    while let Some(result) = contenders.join_next().await {
        result??;
    }

    info!(
        acquired = acquired.load(Ordering::Relaxed),
        callers,
        elapsed = ?started.elapsed(),
        "Contention finished"
    );

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let num_shards = NonZeroUsize::new(args.shards).ok_or(Error::InvalidShards)?;
    let store = RedisLockStore::connect(&RedisLockStoreConfig {
        host: args.redis_host,
        port: args.redis_port,
    })
    .await?;
    let manager = LockManager::new(
        store,
        LockManagerConfig::default().with_num_shards(num_shards),
    );

    match args.command {
        Command::Contend {
            resource_id,
            callers,
            wait_ms,
            lease_ms,
            poll_ms,
            hold_ms,
        } => {
            let timings = LockTimings::new(
                Duration::from_millis(wait_ms),
                Duration::from_millis(lease_ms),
            )
            .with_poll_interval(Duration::from_millis(poll_ms));

            contend(
                &manager,
                &resource_id,
                callers,
                timings,
                Duration::from_millis(hold_ms),
            )
            .await?;
        }
        Command::Status { resource_id, token } => match token {
            Some(token) => {
                let status = manager.check(&resource_id, OwnerToken::new(token)).await?;
                match status {
                    LockStatus::Free => info!(%resource_id, "Lock is free"),
                    LockStatus::HeldBySelf => info!(%resource_id, token, "Lock is held by token"),
                    LockStatus::HeldByOther(owner) => {
                        info!(%resource_id, %owner, "Lock is held by another token");
                    }
                }
            }
            None => {
                let owner = manager
                    .store()
                    .owner(&keylock::record_key(&resource_id))
                    .await?;
                match owner {
                    Some(owner) => info!(%resource_id, %owner, "Lock is held"),
                    None => info!(%resource_id, "Lock is free"),
                }
            }
        },
        Command::Release { resource_id, token } => {
            let released = manager.unlock(&resource_id, OwnerToken::new(token)).await?;
            info!(%resource_id, released, "Release finished");
        }
    }

    manager.shutdown().await?;

    Ok(())
}
