use std::time::Duration;

use serde::Deserialize;

/// Which idle object is lent out first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStrategy {
    /// most recently returned first, lets surplus objects age out
    #[default]
    Mru,
    /// least recently returned first, spreads load across every object
    Lru,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub max_waiters: usize,
    /// `None` waits forever
    pub wait_timeout_ms: Option<u64>,
    /// idle objects older than this are destroyed, `0` disables the reaper
    pub idle_timeout_ms: u64,
    pub creation_timeout_ms: u64,
    /// delay before re-creating after a failed creation, doubled per consecutive failure
    pub creation_backoff_ms: u64,
    pub max_creation_backoff_ms: u64,
    pub strategy: PoolStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 10,
            max_waiters: usize::MAX,
            wait_timeout_ms: None,
            idle_timeout_ms: 25_000,
            creation_timeout_ms: 10_000,
            creation_backoff_ms: 100,
            max_creation_backoff_ms: 5_000,
            strategy: PoolStrategy::Mru,
        }
    }
}

impl PoolConfig {
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn creation_timeout(&self) -> Duration {
        Duration::from_millis(self.creation_timeout_ms)
    }

    /// The backoff following `previous`: the initial delay first, then doubling up to the maximum.
    pub(crate) fn next_creation_backoff(&self, previous: Option<Duration>) -> Duration {
        let max = Duration::from_millis(self.max_creation_backoff_ms);
        match previous {
            None => Duration::from_millis(self.creation_backoff_ms).min(max),
            Some(previous) => previous.saturating_mul(2).min(max),
        }
    }

    /// Clamps the sizes into a usable range: at least one object, and `min_size <= max_size`.
    pub(crate) fn normalized(mut self) -> Self {
        self.max_size = self.max_size.max(1);
        self.min_size = self.min_size.min(self.max_size);
        self.max_creation_backoff_ms = self.max_creation_backoff_ms.max(self.creation_backoff_ms);
        self
    }
}
