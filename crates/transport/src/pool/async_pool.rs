use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{Lifecycle, PoolConfig, PoolError, PoolState, PoolStats, PoolStrategy};
use crate::timeout::millis;

type Delivery<T> = Result<T, PoolError>;

struct Waiter<T> {
    id: u64,
    tx: oneshot::Sender<Delivery<T>>,
}

struct IdleObject<T> {
    object: T,
    since: Instant,
}

struct State<T> {
    run_state: PoolState,
    // alive objects plus creations in flight
    pool_size: usize,
    checked_out: usize,
    idle: VecDeque<IdleObject<T>>,
    waiters: VecDeque<Waiter<T>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    // delay before the next re-creation, `None` after a successful creation
    creation_backoff: Option<Duration>,
    // counters only, gauges are filled in by `AsyncPool::stats`
    counters: PoolStats,
}

struct Inner<T: Send + 'static> {
    name: String,
    config: PoolConfig,
    lifecycle: Arc<dyn Lifecycle<T>>,
    state: Mutex<State<T>>,
    next_waiter: AtomicU64,
}

/// A bounded pool of `T` with FIFO waiters.
///
/// `pool_size` counts live objects and pending creations and never exceeds
/// [`PoolConfig::max_size`]. The pool must be [started](AsyncPool::start) from within a tokio
/// runtime: creation, destruction and idle eviction run as tasks.
pub struct AsyncPool<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Clone for AsyncPool<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Send + 'static> fmt::Debug for AsyncPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncPool").field("name", &self.inner.name).field("stats", &self.stats()).finish()
    }
}

impl<T: Send + 'static> AsyncPool<T> {
    pub fn new(name: impl Into<String>, config: PoolConfig, lifecycle: Arc<dyn Lifecycle<T>>) -> Self {
        let state = State {
            run_state: PoolState::NotYetStarted,
            pool_size: 0,
            checked_out: 0,
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
            shutdown_tx: None,
            creation_backoff: None,
            counters: PoolStats::default(),
        };
        let inner = Inner {
            name: name.into(),
            config: config.normalized(),
            lifecycle,
            state: Mutex::new(state),
            next_waiter: AtomicU64::new(0),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> PoolState {
        self.inner.lock().run_state
    }

    /// Starts the pool: begins creating `min_size` objects and the idle reaper.
    pub fn start(&self) {
        let inner = &self.inner;
        let mut state = inner.lock();
        if state.run_state != PoolState::NotYetStarted {
            warn!(pool = %inner.name, state = %state.run_state, "pool already started");
            return;
        }
        state.run_state = PoolState::Running;

        let mut creations = 0;
        while inner.should_create(&mut state) {
            creations += 1;
        }
        drop(state);

        info!(pool = %inner.name, min_size = inner.config.min_size, max_size = inner.config.max_size, "pool started");
        if let Some(idle_timeout) = inner.config.idle_timeout() {
            tokio::spawn(reap_idle(Arc::downgrade(inner), idle_timeout));
        }
        for _ in 0..creations {
            inner.spawn_create();
        }
    }

    /// Borrows an object: an idle one if available, else a new one if the pool may grow, else the
    /// first one released after every earlier waiter was served.
    pub async fn get(&self) -> Result<Lease<T>, PoolError> {
        let inner = &self.inner;
        loop {
            let (id, rx, create) = {
                let mut state = inner.lock();
                if state.run_state != PoolState::Running {
                    return Err(PoolError::NotRunning { pool: inner.name.clone(), state: state.run_state });
                }

                let candidate = match inner.config.strategy {
                    PoolStrategy::Mru => state.idle.pop_back(),
                    PoolStrategy::Lru => state.idle.pop_front(),
                };
                if let Some(idle) = candidate {
                    state.checked_out += 1;
                    drop(state);
                    if inner.lifecycle.validate_get(&idle.object) {
                        return Ok(Lease::new(idle.object, Arc::clone(inner)));
                    }
                    debug!(pool = %inner.name, "idle object failed validation");
                    inner.release_broken(idle.object);
                    continue;
                }

                if state.waiters.len() >= inner.config.max_waiters {
                    return Err(PoolError::WaiterLimitExceeded {
                        pool: inner.name.clone(),
                        max_waiters: inner.config.max_waiters,
                    });
                }
                let id = inner.next_waiter.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter { id, tx });
                let create = inner.should_create(&mut state);
                (id, rx, create)
            };

            if create {
                inner.spawn_create();
            }

            let mut waiter = WaiterGuard { pool: Arc::clone(inner), id, rx, settled: false };
            let delivery = match inner.config.wait_timeout() {
                Some(limit) => match tokio::time::timeout(limit, &mut waiter.rx).await {
                    Ok(delivery) => delivery,
                    Err(_) => {
                        inner.lock().counters.total_waiter_timeouts += 1;
                        return Err(PoolError::WaiterTimeout { pool: inner.name.clone(), timeout_ms: millis(limit) });
                    }
                },
                None => (&mut waiter.rx).await,
            };
            waiter.settled = true;

            return match delivery {
                Ok(Ok(object)) => Ok(Lease::new(object, Arc::clone(inner))),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(PoolError::ShutDown { pool: inner.name.clone() }),
            };
        }
    }

    /// Stops lending objects and waits up to `grace` for every lease to come back, then destroys
    /// the idle objects. Waiters still queued when `grace` elapses fail with
    /// [`PoolError::ShutDown`].
    pub async fn shutdown(&self, grace: Duration) -> Result<(), PoolError> {
        let inner = &self.inner;
        let done = {
            let mut state = inner.lock();
            match state.run_state {
                PoolState::NotYetStarted => {
                    state.run_state = PoolState::Stopped;
                    return Ok(());
                }
                PoolState::Stopped => return Ok(()),
                PoolState::ShuttingDown => {
                    return Err(PoolError::NotRunning { pool: inner.name.clone(), state: state.run_state });
                }
                PoolState::Running => {}
            }
            info!(pool = %inner.name, grace_ms = millis(grace), "shutting down pool");
            state.run_state = PoolState::ShuttingDown;
            let (tx, rx) = oneshot::channel();
            state.shutdown_tx = Some(tx);
            inner.finish(state);
            rx
        };

        if tokio::time::timeout(grace, done).await.is_ok() {
            return Ok(());
        }

        let (waiters, retired) = {
            let mut state = inner.lock();
            state.run_state = PoolState::Stopped;
            state.shutdown_tx = None;
            let waiters: Vec<Waiter<T>> = state.waiters.drain(..).collect();
            let retired: Vec<T> = state.idle.drain(..).map(|idle| idle.object).collect();
            (waiters, retired)
        };
        warn!(pool = %inner.name, waiters = waiters.len(), "pool shutdown timed out");
        for waiter in waiters {
            let _ = waiter.tx.send(Err(PoolError::ShutDown { pool: inner.name.clone() }));
        }
        for object in retired {
            inner.spawn_destroy(object, false);
        }
        Err(PoolError::ShutdownTimeout { pool: inner.name.clone(), grace_ms: millis(grace) })
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let state = inner.lock();
        PoolStats {
            pool_size: state.pool_size,
            min_size: inner.config.min_size,
            max_size: inner.config.max_size,
            checked_out: state.checked_out,
            idle: state.idle.len(),
            waiters: state.waiters.len(),
            ..state.counters
        }
    }
}

impl<T: Send + 'static> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves a slot for a new object when the pool is running, below `max_size`, and either
    /// someone is waiting or the pool is below `min_size`.
    fn should_create(&self, state: &mut State<T>) -> bool {
        let wanted = !state.waiters.is_empty() || state.pool_size < self.config.min_size;
        if state.run_state == PoolState::Running && state.pool_size < self.config.max_size && wanted {
            state.pool_size += 1;
            state.counters.peak_pool_size = state.counters.peak_pool_size.max(state.pool_size);
            return true;
        }
        false
    }

    /// Completes a pending shutdown once every object is back and idle; returns the objects to
    /// destroy.
    fn complete_shutdown(&self, state: &mut State<T>) -> Vec<T> {
        if state.run_state != PoolState::ShuttingDown
            || !state.waiters.is_empty()
            || state.checked_out > 0
            || state.idle.len() != state.pool_size
        {
            return Vec::new();
        }
        state.run_state = PoolState::Stopped;
        if let Some(tx) = state.shutdown_tx.take() {
            let _ = tx.send(());
        }
        info!(pool = %self.name, "pool stopped");
        state.idle.drain(..).map(|idle| idle.object).collect()
    }

    /// Releases the lock after a state change, then starts whatever creation or destruction the
    /// change calls for.
    fn finish(self: &Arc<Self>, mut state: MutexGuard<'_, State<T>>) {
        let create = self.should_create(&mut state);
        let retired = self.complete_shutdown(&mut state);
        drop(state);
        for object in retired {
            self.spawn_destroy(object, false);
        }
        if create {
            self.spawn_create();
        }
    }

    fn spawn_create(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.create_object().await });
    }

    async fn create_object(self: Arc<Self>) {
        {
            let mut state = self.lock();
            let below_min =
                state.run_state == PoolState::Running && state.checked_out + state.idle.len() < self.config.min_size;
            if state.waiters.is_empty() && !below_min {
                // nobody needs the object anymore
                state.pool_size = state.pool_size.saturating_sub(1);
                let retired = self.complete_shutdown(&mut state);
                drop(state);
                for object in retired {
                    self.spawn_destroy(object, false);
                }
                return;
            }
        }

        let creation_timeout = self.config.creation_timeout();
        match tokio::time::timeout(creation_timeout, self.lifecycle.create()).await {
            Ok(Ok(object)) => {
                let mut state = self.lock();
                state.counters.total_created += 1;
                state.creation_backoff = None;
                debug!(pool = %self.name, pool_size = state.pool_size, "created pool object");
                self.add(state, object);
            }
            Ok(Err(e)) => {
                error!(pool = %self.name, cause = %e, "failed to create pool object");
                self.creation_failed(PoolError::Creation { pool: self.name.clone(), source: Arc::from(e) });
            }
            Err(_) => {
                let e = PoolError::CreationTimeout { pool: self.name.clone(), timeout_ms: millis(creation_timeout) };
                error!(pool = %self.name, cause = %e, "failed to create pool object");
                self.creation_failed(e);
            }
        }
    }

    /// Fails every queued waiter with `error` and releases the reserved slot. A pool left below
    /// `min_size` schedules a replacement behind the creation backoff, which doubles with every
    /// consecutive failure.
    fn creation_failed(self: &Arc<Self>, error: PoolError) {
        let (waiters, retired, retry) = {
            let mut state = self.lock();
            state.pool_size = state.pool_size.saturating_sub(1);
            state.counters.total_create_errors += 1;
            let backoff = self.config.next_creation_backoff(state.creation_backoff);
            state.creation_backoff = Some(backoff);
            let waiters: Vec<Waiter<T>> = state.waiters.drain(..).collect();
            let retry = self.should_create(&mut state).then_some(backoff);
            let retired = self.complete_shutdown(&mut state);
            (waiters, retired, retry)
        };
        for waiter in waiters {
            let _ = waiter.tx.send(Err(error.clone()));
        }
        for object in retired {
            self.spawn_destroy(object, false);
        }
        if let Some(backoff) = retry {
            debug!(pool = %self.name, backoff_ms = millis(backoff), "scheduling pool object re-creation");
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                pool.create_object().await;
            });
        }
    }

    /// Hands `object` to the oldest live waiter, or parks it as idle.
    fn add(self: &Arc<Self>, mut state: MutexGuard<'_, State<T>>, mut object: T) {
        if state.run_state == PoolState::Stopped {
            drop(state);
            self.spawn_destroy(object, false);
            return;
        }

        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(Ok(object)) {
                Ok(()) => {
                    state.checked_out += 1;
                    self.finish(state);
                    return;
                }
                Err(undelivered) => match undelivered {
                    Ok(returned) => object = returned,
                    Err(_) => return,
                },
            }
        }

        state.idle.push_back(IdleObject { object, since: Instant::now() });
        self.finish(state);
    }

    /// Takes back a lent object that is still healthy.
    fn give_back(self: &Arc<Self>, object: T) {
        if !self.lifecycle.validate_put(&object) {
            debug!(pool = %self.name, "returned object failed validation");
            self.release_broken(object);
            return;
        }
        let mut state = self.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        self.add(state, object);
    }

    /// Takes back a lent object and destroys it.
    fn release_broken(self: &Arc<Self>, object: T) {
        {
            let mut state = self.lock();
            state.checked_out = state.checked_out.saturating_sub(1);
        }
        self.spawn_destroy(object, true);
    }

    fn spawn_destroy(self: &Arc<Self>, object: T, error: bool) {
        let pool = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.lifecycle.destroy(object, error).await;
                    pool.object_destroyed(error);
                });
            }
            Err(_) => {
                warn!(pool = %self.name, "no runtime available to destroy pool object, dropping it");
                drop(object);
                pool.object_destroyed(error);
            }
        }
    }

    fn object_destroyed(self: &Arc<Self>, error: bool) {
        let mut state = self.lock();
        state.pool_size = state.pool_size.saturating_sub(1);
        state.counters.total_destroyed += 1;
        if error {
            state.counters.total_bad_destroyed += 1;
        }
        debug!(pool = %self.name, pool_size = state.pool_size, error, "destroyed pool object");
        self.finish(state);
    }

    /// Removes a waiter that stopped waiting. If an object was handed to it in the meantime the
    /// object goes back to the pool.
    fn abandon_waiter(self: &Arc<Self>, id: u64, rx: &mut oneshot::Receiver<Delivery<T>>) {
        {
            let mut state = self.lock();
            if let Some(position) = state.waiters.iter().position(|waiter| waiter.id == id) {
                state.waiters.remove(position);
                self.finish(state);
                return;
            }
        }
        rx.close();
        if let Ok(Ok(object)) = rx.try_recv() {
            self.give_back(object);
        }
    }

    /// Evicts idle objects older than `idle_timeout`, keeping `min_size`. Returns `false` once the
    /// pool stopped.
    fn reap(self: &Arc<Self>, idle_timeout: Duration) -> bool {
        let mut state = self.lock();
        match state.run_state {
            PoolState::Running => {}
            PoolState::NotYetStarted | PoolState::ShuttingDown => return true,
            PoolState::Stopped => return false,
        }

        let now = Instant::now();
        let mut surplus = state.pool_size.saturating_sub(self.config.min_size);
        let mut expired = Vec::new();
        while surplus > 0 {
            match state.idle.front() {
                Some(idle) if now.duration_since(idle.since) >= idle_timeout => {}
                _ => break,
            }
            if let Some(idle) = state.idle.pop_front() {
                expired.push(idle.object);
            }
            surplus -= 1;
        }
        drop(state);

        if !expired.is_empty() {
            debug!(pool = %self.name, count = expired.len(), "evicting idle pool objects");
        }
        for object in expired {
            self.spawn_destroy(object, false);
        }
        true
    }
}

async fn reap_idle<T: Send + 'static>(pool: Weak<Inner<T>>, idle_timeout: Duration) {
    let mut ticker = tokio::time::interval((idle_timeout / 2).max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            return;
        };
        if !pool.reap(idle_timeout) {
            return;
        }
    }
}

struct WaiterGuard<T: Send + 'static> {
    pool: Arc<Inner<T>>,
    id: u64,
    rx: oneshot::Receiver<Delivery<T>>,
    settled: bool,
}

impl<T: Send + 'static> Drop for WaiterGuard<T> {
    fn drop(&mut self) {
        if !self.settled {
            self.pool.abandon_waiter(self.id, &mut self.rx);
        }
    }
}

/// Exclusive use of a pooled object.
///
/// End a lease with [`Lease::put`] when the object is healthy or [`Lease::dispose`] when it is not.
/// Dropping a lease disposes the object.
pub struct Lease<T: Send + 'static> {
    object: Option<T>,
    pool: Arc<Inner<T>>,
}

impl<T: Send + 'static> Lease<T> {
    fn new(object: T, pool: Arc<Inner<T>>) -> Self {
        Self { object: Some(object), pool }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    /// Returns the object to the pool for reuse.
    pub fn put(mut self) {
        if let Some(object) = self.object.take() {
            self.pool.give_back(object);
        }
    }

    /// Destroys the object and frees its slot.
    pub fn dispose(mut self) {
        if let Some(object) = self.object.take() {
            self.pool.release_broken(object);
        }
    }
}

impl<T: Send + 'static> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.object {
            Some(object) => object,
            None => unreachable!("lease object is only taken when the lease is consumed"),
        }
    }
}

impl<T: Send + 'static> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.object {
            Some(object) => object,
            None => unreachable!("lease object is only taken when the lease is consumed"),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("pool", &self.pool.name).finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            debug!(pool = %self.pool.name, "lease dropped without put or dispose, destroying object");
            self.pool.release_broken(object);
        }
    }
}
