//! Bounded pool of authenticated clients for one endpoint.
//!
//! At most `bound` connections exist at any moment, counting both idle and
//! checked-out ones. A checked-out [`PooledClient`] is owned by exactly one
//! caller; it goes back through [`ConnectionPool::release`] or
//! [`ConnectionPool::discard`]. Dropping it without either frees the slot and
//! lets the underlying client close itself.

use crate::sync::client::ClientFactory;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sorng_core::client::TransferClient;
use sorng_core::config::EngineConfig;
use sorng_core::error::SyncResult;
use sorng_core::profile::ConnectionProfile;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

// ─── Settings & stats ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub bound: usize,
    pub freshness: Duration,
    pub wait: Duration,
    pub jitter: Duration,
}

impl PoolSettings {
    pub fn new(profile: &ConnectionProfile, config: &EngineConfig) -> Self {
        Self {
            bound: profile.effective_pool_size(),
            freshness: config.pool_freshness(),
            wait: config.pool_wait(),
            jitter: config.connect_jitter(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub bound: usize,
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub peak: usize,
    pub created: u64,
    pub discarded: u64,
}

// ─── Checked-out client ─────────────────────────────────────────────

pub struct PooledClient<C> {
    id: u64,
    generation: u64,
    client: C,
    lease: Option<Weak<Shared<C>>>,
}

impl<C> PooledClient<C> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<C> Deref for PooledClient<C> {
    type Target = C;
    fn deref(&self) -> &C {
        &self.client
    }
}

impl<C> DerefMut for PooledClient<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.client
    }
}

impl<C> Drop for PooledClient<C> {
    fn drop(&mut self) {
        if let Some(shared) = self.lease.take().and_then(|w| w.upgrade()) {
            log::warn!("pool: connection #{} dropped while checked out", self.id);
            shared.forget_slot();
        }
    }
}

// ─── Shared state ───────────────────────────────────────────────────

struct Idle<C> {
    entry: PooledClient<C>,
    released_at: Instant,
}

struct PoolState<C> {
    idle: Vec<Idle<C>>,
    live: usize,
    in_use: usize,
    peak: usize,
    generation: u64,
    created: u64,
    discarded: u64,
}

struct Shared<C> {
    state: Mutex<PoolState<C>>,
    notify: Notify,
}

impl<C> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A checked-out connection is gone; free its slot.
    fn forget_slot(&self) {
        {
            let mut st = self.lock();
            st.live = st.live.saturating_sub(1);
            st.in_use = st.in_use.saturating_sub(1);
            st.discarded += 1;
        }
        self.notify.notify_one();
    }
}

/// A slot counted in `live` before its connection exists. Dropping the
/// reservation, because the connect failed or the caller went away, gives
/// the slot back.
struct SlotReservation<'a, C> {
    shared: &'a Shared<C>,
    armed: bool,
}

impl<'a, C> SlotReservation<'a, C> {
    fn new(shared: &'a Shared<C>) -> Self {
        Self { shared, armed: true }
    }

    /// The slot now belongs to a [`PooledClient`].
    fn defuse(mut self) {
        self.armed = false;
    }
}

impl<C> Drop for SlotReservation<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut st = self.shared.lock();
            st.live = st.live.saturating_sub(1);
            st.in_use = st.in_use.saturating_sub(1);
        }
        self.shared.notify.notify_one();
    }
}

enum Next<C> {
    Reuse(Idle<C>),
    Open(u64),
    Wait,
}

// ─── Pool ───────────────────────────────────────────────────────────

pub struct ConnectionPool<F: ClientFactory> {
    factory: F,
    settings: PoolSettings,
    shared: Arc<Shared<F::Client>>,
    next_id: AtomicU64,
}

impl<F: ClientFactory> ConnectionPool<F> {
    pub fn new(factory: F, settings: PoolSettings) -> Self {
        let settings = PoolSettings {
            bound: settings.bound.max(1),
            ..settings
        };
        Self {
            factory,
            settings,
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    live: 0,
                    in_use: 0,
                    peak: 0,
                    generation: 0,
                    created: 0,
                    discarded: 0,
                }),
                notify: Notify::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn bound(&self) -> usize {
        self.settings.bound
    }

    /// Check out a connection, opening one if below the bound and waiting
    /// otherwise. Connection errors from the factory are returned as-is.
    pub async fn acquire(&self) -> SyncResult<PooledClient<F::Client>> {
        loop {
            let next = {
                let mut st = self.shared.lock();
                if let Some(idle) = st.idle.pop() {
                    st.in_use += 1;
                    Next::Reuse(idle)
                } else if st.live < self.settings.bound {
                    st.live += 1;
                    st.in_use += 1;
                    st.peak = st.peak.max(st.live);
                    Next::Open(st.generation)
                } else {
                    Next::Wait
                }
            };

            match next {
                Next::Reuse(Idle {
                    mut entry,
                    released_at,
                }) => {
                    entry.lease = Some(Arc::downgrade(&self.shared));
                    if released_at.elapsed() <= self.settings.freshness {
                        return Ok(entry);
                    }
                    if entry.client.check_connection().await {
                        return Ok(entry);
                    }
                    log::debug!(
                        "pool: connection #{} to {} failed its liveness probe",
                        entry.id,
                        self.factory.endpoint()
                    );
                    self.discard(entry).await;
                }
                Next::Open(generation) => {
                    let slot = SlotReservation::new(&self.shared);
                    return self.open(generation, slot).await;
                }
                Next::Wait => {
                    let notified = self.shared.notify.notified();
                    let _ = tokio::time::timeout(self.settings.wait, notified).await;
                }
            }
        }
    }

    async fn open(
        &self,
        generation: u64,
        slot: SlotReservation<'_, F::Client>,
    ) -> SyncResult<PooledClient<F::Client>> {
        let jitter = self.jitter();
        if !jitter.is_zero() {
            tokio::time::sleep(jitter).await;
        }
        match self.factory.connect().await {
            Ok(client) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                slot.defuse();
                self.shared.lock().created += 1;
                log::debug!("pool: opened connection #{} to {}", id, self.factory.endpoint());
                Ok(PooledClient {
                    id,
                    generation,
                    client,
                    lease: Some(Arc::downgrade(&self.shared)),
                })
            }
            Err(e) => {
                drop(slot);
                log::debug!("pool: connect to {} failed: {}", self.factory.endpoint(), e);
                Err(e)
            }
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.settings.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// Return a connection for reuse. Closed connections and connections
    /// opened before the last [`close_all`](Self::close_all) are discarded.
    pub async fn release(&self, mut entry: PooledClient<F::Client>) {
        let stale = entry.client.is_closed() || entry.generation != self.shared.lock().generation;
        if stale {
            self.discard(entry).await;
            return;
        }
        entry.lease = None;
        {
            let mut st = self.shared.lock();
            st.in_use = st.in_use.saturating_sub(1);
            st.idle.push(Idle {
                entry,
                released_at: Instant::now(),
            });
        }
        self.shared.notify.notify_one();
    }

    /// Force-close a connection and free its slot.
    pub async fn discard(&self, mut entry: PooledClient<F::Client>) {
        entry.lease = None;
        entry.client.close().await;
        log::debug!("pool: discarded connection #{}", entry.id);
        self.shared.forget_slot();
    }

    /// Release on success, discard when the error says the connection is
    /// no longer trustworthy.
    pub async fn settle<T>(&self, entry: PooledClient<F::Client>, result: &SyncResult<T>) {
        match result {
            Err(e) if e.forces_discard() => self.discard(entry).await,
            _ => self.release(entry).await,
        }
    }

    /// Close every idle connection and make checked-out ones non-returnable.
    pub async fn close_all(&self) {
        let idle = {
            let mut st = self.shared.lock();
            st.generation += 1;
            let idle = std::mem::take(&mut st.idle);
            st.live = st.live.saturating_sub(idle.len());
            st.discarded += idle.len() as u64;
            idle
        };
        let closed = idle.len();
        for mut i in idle {
            i.entry.client.close().await;
        }
        self.shared.notify.notify_waiters();
        if closed > 0 {
            log::info!("pool: closed {} idle connection(s) to {}", closed, self.factory.endpoint());
        }
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.shared.lock();
        PoolStats {
            bound: self.settings.bound,
            live: st.live,
            idle: st.idle.len(),
            in_use: st.in_use,
            peak: st.peak,
            created: st.created,
            discarded: st.discarded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::memory::{MemoryFactory, MemoryRemote};

    fn settings(bound: usize, freshness: Duration) -> PoolSettings {
        PoolSettings {
            bound,
            freshness,
            wait: Duration::from_millis(10),
            jitter: Duration::ZERO,
        }
    }

    fn pool(remote: &MemoryRemote, bound: usize) -> Arc<ConnectionPool<MemoryFactory>> {
        Arc::new(ConnectionPool::new(
            remote.factory(),
            settings(bound, Duration::from_secs(30)),
        ))
    }

    #[tokio::test]
    async fn never_exceeds_the_bound() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 2);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let c = pool.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                pool.release(c).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let stats = pool.stats();
        assert!(stats.peak <= 2);
        assert!(remote.counters().peak_connections <= 2);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, stats.live);
    }

    #[tokio::test]
    async fn fresh_entries_skip_the_probe() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 1);
        let c = pool.acquire().await.unwrap();
        let id = c.id();
        pool.release(c).await;
        let c = pool.acquire().await.unwrap();
        assert_eq!(c.id(), id);
        assert_eq!(remote.counters().probes, 0);
        pool.release(c).await;
    }

    #[tokio::test]
    async fn stale_entry_failing_its_probe_is_replaced() {
        let remote = MemoryRemote::new();
        let pool = ConnectionPool::new(remote.factory(), settings(1, Duration::ZERO));
        let c = pool.acquire().await.unwrap();
        let first = c.id();
        pool.release(c).await;

        remote.set_probes_fail(true);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let c = pool.acquire().await.unwrap();
        assert_ne!(c.id(), first);
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.stats().live, 1);
        pool.release(c).await;
    }

    #[tokio::test]
    async fn closed_clients_are_not_pooled() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 1);
        let mut c = pool.acquire().await.unwrap();
        c.close().await;
        pool.release(c).await;
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.live, 0);
    }

    #[tokio::test]
    async fn connect_failure_frees_the_slot() {
        let remote = MemoryRemote::new();
        remote.fail_connects(vec![sorng_core::error::SyncError::connection_failed("refused")]);
        let pool = pool(&remote, 1);
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.stats().live, 0);
        let c = pool.acquire().await.unwrap();
        pool.release(c).await;
    }

    #[tokio::test]
    async fn close_all_keeps_checked_out_entries_from_returning() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a).await;
        pool.close_all().await;
        assert_eq!(pool.stats().live, 1);

        pool.release(b).await;
        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(remote.counters().live_connections, 0);
    }

    #[tokio::test]
    async fn abandoned_connect_frees_the_slot() {
        let remote = MemoryRemote::new().with_connect_delay(Duration::from_millis(300));
        let pool = pool(&remote, 1);
        let pending = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _ = pool.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pending.abort();
        let _ = pending.await;

        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.in_use, 0);
        let c = tokio::time::timeout(Duration::from_secs(2), pool.acquire())
            .await
            .expect("slot was not returned")
            .unwrap();
        pool.release(c).await;
    }

    #[tokio::test]
    async fn dropped_lease_frees_the_slot() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 1);
        let c = pool.acquire().await.unwrap();
        drop(c);
        assert_eq!(pool.stats().live, 0);
        let c = pool.acquire().await.unwrap();
        pool.release(c).await;
    }
}
