use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use super::{AsyncPool, Lease, Lifecycle, PoolConfig, PoolError, PoolState, PoolStats};

/// Identifies the remote endpoint a pool connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl PoolKey {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self { host: host.into(), port, tls }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

type LifecycleFactory<T> = dyn Fn(&PoolKey) -> Arc<dyn Lifecycle<T>> + Send + Sync;

struct Pools<T: Send + 'static> {
    by_key: HashMap<PoolKey, AsyncPool<T>>,
    shut_down: bool,
}

/// One started [`AsyncPool`] per [`PoolKey`], created on first use.
pub struct PoolManager<T: Send + 'static> {
    config: PoolConfig,
    factory: Box<LifecycleFactory<T>>,
    pools: Mutex<Pools<T>>,
}

impl<T: Send + 'static> fmt::Debug for PoolManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pools = self.lock();
        f.debug_struct("PoolManager")
            .field("pools", &pools.by_key.keys().collect::<Vec<_>>())
            .field("shut_down", &pools.shut_down)
            .finish()
    }
}

impl<T: Send + 'static> PoolManager<T> {
    pub fn new<F>(config: PoolConfig, factory: F) -> Self
    where
        F: Fn(&PoolKey) -> Arc<dyn Lifecycle<T>> + Send + Sync + 'static,
    {
        Self {
            config,
            factory: Box::new(factory),
            pools: Mutex::new(Pools { by_key: HashMap::new(), shut_down: false }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pools<T>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The pool for `key`, created and started on first use. Must be called within a tokio runtime.
    pub fn pool(&self, key: &PoolKey) -> Result<AsyncPool<T>, PoolError> {
        let mut pools = self.lock();
        if pools.shut_down {
            return Err(PoolError::NotRunning { pool: key.to_string(), state: PoolState::Stopped });
        }
        if let Some(pool) = pools.by_key.get(key) {
            return Ok(pool.clone());
        }

        let pool = AsyncPool::new(key.to_string(), self.config.clone(), (self.factory)(key));
        pool.start();
        info!(pool = %key, "created connection pool");
        pools.by_key.insert(key.clone(), pool.clone());
        Ok(pool)
    }

    pub async fn get(&self, key: &PoolKey) -> Result<Lease<T>, PoolError> {
        self.pool(key)?.get().await
    }

    pub fn keys(&self) -> Vec<PoolKey> {
        self.lock().by_key.keys().cloned().collect()
    }

    /// Statistics of the pool for `key`, if one was created.
    pub fn stats(&self, key: &PoolKey) -> Option<PoolStats> {
        self.lock().by_key.get(key).map(AsyncPool::stats)
    }

    /// Shuts every pool down concurrently, each with the same `grace`. Returns the first failure.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), PoolError> {
        let pools: Vec<AsyncPool<T>> = {
            let mut pools = self.lock();
            pools.shut_down = true;
            pools.by_key.drain().map(|(_, pool)| pool).collect()
        };
        info!(pools = pools.len(), "shutting down connection pools");

        let results = join_all(pools.iter().map(|pool| pool.shutdown(grace))).await;
        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                warn!(cause = %e, "connection pool shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::error::Error;

    struct Named(PoolKey);

    #[async_trait]
    impl Lifecycle<String> for Named {
        async fn create(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
            Ok(self.0.to_string())
        }

        async fn destroy(&self, _object: String, _error: bool) {}
    }

    fn manager() -> PoolManager<String> {
        let config = PoolConfig { idle_timeout_ms: 0, ..PoolConfig::default() };
        PoolManager::new(config, |key| Arc::new(Named(key.clone())) as Arc<dyn Lifecycle<String>>)
    }

    #[tokio::test]
    async fn pools_are_keyed_by_endpoint() {
        let manager = manager();
        let a = PoolKey::new("localhost", 8080, false);
        let b = PoolKey::new("localhost", 8443, true);

        let lease = manager.get(&a).await.unwrap();
        assert_eq!(lease.as_str(), "http://localhost:8080");
        lease.put();
        assert_eq!(manager.get(&b).await.unwrap().as_str(), "https://localhost:8443");

        assert_eq!(manager.keys().len(), 2);
        assert_eq!(manager.pool(&a).unwrap().stats().total_created, 1);
    }

    #[tokio::test]
    async fn shutdown_cascades_to_every_pool() {
        let manager = manager();
        let key = PoolKey::new("localhost", 1, false);
        let pool = manager.pool(&key).unwrap();
        manager.get(&key).await.unwrap().put();

        manager.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.state(), PoolState::Stopped);
        assert!(matches!(manager.get(&key).await, Err(PoolError::NotRunning { .. })));
    }
}
