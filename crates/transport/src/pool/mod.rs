//! Bounded asynchronous object pools.
//!
//! The client keeps one [`AsyncPool`] of connections per remote endpoint, keyed and created on demand
//! by a [`PoolManager`]. A pool lends its objects through [`Lease`]s: a lease is exclusive, and must
//! end either with [`Lease::put`] (the object is healthy and may be reused) or [`Lease::dispose`]
//! (the object is destroyed). A lease dropped without either is disposed.

mod async_pool;
mod config;
mod manager;

pub use async_pool::AsyncPool;
pub use async_pool::Lease;
pub use config::PoolConfig;
pub use config::PoolStrategy;
pub use manager::PoolKey;
pub use manager::PoolManager;

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Creates, validates and destroys the objects of a pool.
#[async_trait]
pub trait Lifecycle<T: Send + 'static>: Send + Sync + 'static {
    async fn create(&self) -> Result<T, Box<dyn Error + Send + Sync>>;

    /// Checked before an idle object is lent out; a failed object is destroyed.
    fn validate_get(&self, _object: &T) -> bool {
        true
    }

    /// Checked when an object is returned; a failed object is destroyed.
    fn validate_put(&self, _object: &T) -> bool {
        true
    }

    /// `error` tells whether the object is destroyed because it is broken.
    async fn destroy(&self, object: T, error: bool);
}

/// Run state of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    NotYetStarted,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotYetStarted => "NOT_YET_STARTED",
            Self::Running => "RUNNING",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("{pool} is {state}")]
    NotRunning { pool: String, state: PoolState },

    #[error("AsyncPool {pool} reached maximum waiter size: {max_waiters}")]
    WaiterLimitExceeded { pool: String, max_waiters: usize },

    #[error("Exceeded waiter timeout of {timeout_ms}ms: in Pool: {pool}")]
    WaiterTimeout { pool: String, timeout_ms: u64 },

    #[error("Exceeded creation timeout of {timeout_ms}ms: in Pool: {pool}")]
    CreationTimeout { pool: String, timeout_ms: u64 },

    #[error("failed to create object in pool {pool}: {source}")]
    Creation { pool: String, source: Arc<dyn Error + Send + Sync> },

    #[error("pool {pool} shut down while waiting for an object")]
    ShutDown { pool: String },

    #[error("pool {pool} did not shut down within {grace_ms}ms")]
    ShutdownTimeout { pool: String, grace_ms: u64 },
}

impl PoolError {
    /// The error the lifecycle reported when creating an object failed.
    pub fn creation_cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            Self::Creation { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// A snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// objects alive or being created
    pub pool_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub checked_out: usize,
    pub idle: usize,
    pub waiters: usize,
    pub peak_pool_size: usize,
    pub total_created: u64,
    pub total_destroyed: u64,
    pub total_create_errors: u64,
    pub total_bad_destroyed: u64,
    pub total_waiter_timeouts: u64,
}
