//! Sharded registry of latches for keys with local waiters.
//!
//! Each shard owns a waiter count and a latch per key, both mutated only under
//! the shard's mutex. Critical sections are a handful of map operations; no
//! store round trip or wait ever happens while a shard is locked.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;
use twox_hash::XxHash64;

struct ShardState<L> {
    waiters: HashMap<String, usize>,
    latches: HashMap<String, Arc<L>>,
}

impl<L> Default for ShardState<L> {
    fn default() -> Self {
        Self {
            waiters: HashMap::new(),
            latches: HashMap::new(),
        }
    }
}

struct Shard<L> {
    state: Mutex<ShardState<L>>,
}

pub struct Registry<L> {
    shards: Box<[Shard<L>]>,
}

impl<L> Registry<L> {
    pub fn new(num_shards: NonZeroUsize) -> Self {
        let shards = (0..num_shards.get())
            .map(|_| Shard {
                state: Mutex::new(ShardState::default()),
            })
            .collect();

        Self { shards }
    }

    // Truncating the hash on 32-bit targets still spreads keys evenly.
    #[allow(clippy::cast_possible_truncation)]
    fn shard_index(&self, key: &str) -> usize {
        XxHash64::oneshot(0, key.as_bytes()) as usize % self.shards.len()
    }

    /// Registers interest in `key`, creating its latch with `make` if no other
    /// local waiter holds one. Interest is withdrawn when the returned handle
    /// drops; the last one out evicts the latch.
    pub fn register(&self, key: &str, make: impl FnOnce() -> L) -> Interest<'_, L> {
        let shard = &self.shards[self.shard_index(key)];

        let latch = {
            let mut state = shard.state.lock();
            let latch = Arc::clone(
                state
                    .latches
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(make())),
            );
            *state.waiters.entry(key.to_string()).or_insert(0) += 1;
            latch
        };

        Interest {
            shard,
            key: key.to_string(),
            latch,
        }
    }

    /// Number of keys that currently have a latch.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.state.lock().latches.len())
            .sum()
    }

    /// Number of local waiters registered for `key`.
    pub fn waiters(&self, key: &str) -> usize {
        let shard = &self.shards[self.shard_index(key)];
        let count = shard.state.lock().waiters.get(key).copied();

        count.unwrap_or(0)
    }
}

/// One local waiter's share of a latch.
pub struct Interest<'a, L> {
    shard: &'a Shard<L>,
    key: String,
    latch: Arc<L>,
}

impl<L> Interest<'_, L> {
    pub fn latch(&self) -> &L {
        &self.latch
    }
}

impl<L> Drop for Interest<'_, L> {
    fn drop(&mut self) {
        let evicted = {
            let mut state = self.shard.state.lock();

            match state.waiters.get_mut(&self.key) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    None
                }
                Some(_) => {
                    state.waiters.remove(&self.key);
                    state.latches.remove(&self.key)
                }
                None => None,
            }
        };

        // The evicted latch (and our own handle right after) drops outside the
        // shard lock, which is where its subscription is torn down.
        drop(evicted);
    }
}
