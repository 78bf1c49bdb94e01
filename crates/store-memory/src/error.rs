use keylock_store::LockStoreError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The store was closed.
    #[error("memory lock store is closed")]
    Closed,
}

impl LockStoreError for Error {}
