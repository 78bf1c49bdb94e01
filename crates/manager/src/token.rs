use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use keylock_store::OwnerToken;
use parking_lot::Mutex;

/// Source of owner tokens for `with_lock`.
pub trait TokenGenerator: Debug + Send + Sync + 'static {
    /// Returns a token for one acquisition attempt.
    fn next_token(&self) -> OwnerToken;
}

/// Uniformly random tokens.
#[derive(Debug)]
pub struct RandomTokens {
    rng: Mutex<fastrand::Rng>,
}

impl RandomTokens {
    /// Creates a generator seeded from the system.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Creates a generator with a fixed seed.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }
}

impl Default for RandomTokens {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenGenerator for RandomTokens {
    fn next_token(&self) -> OwnerToken {
        OwnerToken::new(self.rng.lock().u64(..))
    }
}

/// Consecutive tokens, for tests that assert on exact owners.
#[derive(Debug, Default)]
pub struct SequentialTokens {
    next: AtomicU64,
}

impl SequentialTokens {
    /// Starts the sequence at `first`.
    #[must_use]
    pub const fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl TokenGenerator for SequentialTokens {
    fn next_token(&self) -> OwnerToken {
        OwnerToken::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_tokens_repeat() {
        let first = RandomTokens::with_seed(7);
        let second = RandomTokens::with_seed(7);

        for _ in 0..4 {
            assert_eq!(first.next_token(), second.next_token());
        }
    }

    #[test]
    fn test_sequential_tokens() {
        let tokens = SequentialTokens::starting_at(100);

        assert_eq!(tokens.next_token(), OwnerToken::new(100));
        assert_eq!(tokens.next_token(), OwnerToken::new(101));
    }
}
