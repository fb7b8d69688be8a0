//! Bounded shell session pool with lifecycle recovery
//!
//! The manager owns at most one pool at a time. Callers only see
//! [`SessionPoolManager::acquire`]; a pool found closed or broken is
//! replaced under the lifecycle lock before a session is handed out.

use crate::compiler::{HostInfo, ScriptLimits};
use crate::error::{Result, ScriptError};
use crate::language::ScriptLanguage;
use crate::modules::ModuleCatalog;
use crate::shell::session::{LifecycleState, SessionSeed, ShellSession};
use arc_swap::ArcSwapOption;
use nautilus_state::GlobalStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Pool sizing and wait behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPoolConfig {
    /// Sessions opened with the pool
    pub min_sessions: usize,
    /// Upper bound; derived from the processor count when unset
    pub max_sessions: Option<usize>,
    /// Wait between checks while another caller opens the pool
    #[serde(with = "humantime_serde")]
    pub open_spin_interval: Duration,
    /// How long a caller waits for a free session
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            min_sessions: 1,
            max_sessions: None,
            open_spin_interval: Duration::from_millis(10),
            acquire_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl SessionPoolConfig {
    /// Effective `(min, max)` after defaults and clamping
    pub fn bounds(&self) -> (usize, usize) {
        let max = self
            .max_sessions
            .unwrap_or_else(|| num_cpus::get().max(2))
            .clamp(1, Semaphore::MAX_PERMITS);
        (self.min_sessions.min(max), max)
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Current pool state
    pub state: LifecycleState,
    /// Pools created so far; 0 before the first acquire
    pub generation: u64,
    /// Configured minimum
    pub min_sessions: usize,
    /// Effective maximum
    pub max_sessions: usize,
    /// Sessions alive in the current pool
    pub live: usize,
    /// Idle sessions in the current pool
    pub idle: usize,
    /// Sessions currently leased
    pub in_use: usize,
    /// Checkouts from the current pool
    pub checkouts: u64,
    /// Sessions opened by the current pool
    pub created: u64,
    /// Pools replaced after being closed or broken
    pub rebuilds: u64,
}

#[derive(Debug)]
struct SessionPool {
    generation: u64,
    state: Mutex<LifecycleState>,
    idle: Mutex<Vec<ShellSession>>,
    live: AtomicUsize,
    permits: Arc<Semaphore>,
    min: usize,
    max: usize,
    seed: SessionSeed,
    next_id: AtomicU64,
    checkouts: AtomicU64,
    created: AtomicU64,
}

impl SessionPool {
    fn new(generation: u64, min: usize, max: usize, seed: SessionSeed) -> Self {
        Self {
            generation,
            state: Mutex::new(LifecycleState::BeforeOpen),
            idle: Mutex::new(Vec::with_capacity(max)),
            live: AtomicUsize::new(0),
            permits: Arc::new(Semaphore::new(max)),
            min,
            max,
            seed,
            next_id: AtomicU64::new(1),
            checkouts: AtomicU64::new(0),
            created: AtomicU64::new(0),
        }
    }

    fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock() = state;
    }

    /// Move `from -> to`; false when another transition won
    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn new_session(&self) -> ShellSession {
        let id = self.generation * 1_000_000 + self.next_id.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
        ShellSession::open(id, &self.seed)
    }

    /// Seed the minimum sessions; caller has already marked `Opening`
    fn open(&self) {
        let sessions: Vec<ShellSession> = (0..self.min).map(|_| self.new_session()).collect();
        self.idle.lock().extend(sessions);
        if self.transition(LifecycleState::Opening, LifecycleState::Opened) {
            info!(
                generation = self.generation,
                min = self.min,
                max = self.max,
                "Shell session pool opened"
            );
        }
    }

    /// Lease a session; `None` when the pool left `Opened` while waiting
    async fn checkout(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Option<SessionLease>> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = match timeout {
            Some(limit) => tokio::time::timeout(limit, acquire).await.map_err(|_| {
                ScriptError::SessionPool(format!(
                    "timed out after {limit:?} waiting for a shell session"
                ))
            })?,
            None => acquire.await,
        };
        let Ok(permit) = permit else {
            return Ok(None);
        };
        if self.state() != LifecycleState::Opened {
            return Ok(None);
        }

        let reused = self.idle.lock().pop();
        let session = match reused {
            Some(session) => session,
            None => self.new_session(),
        };
        self.checkouts.fetch_add(1, Ordering::Relaxed);
        Ok(Some(SessionLease {
            pool: Arc::clone(self),
            session: Some(session),
            permit: Some(permit),
            invalidated: false,
        }))
    }

    fn release(&self, mut session: ShellSession, broken: bool) {
        session.record_invocation();
        if broken {
            warn!(
                session = session.id(),
                generation = self.generation,
                "Shell session broken; pool will be rebuilt"
            );
            session.mark_broken();
            self.retire(session);
            self.mark_broken();
            return;
        }
        if self.state() == LifecycleState::Opened {
            self.idle.lock().push(session);
        } else {
            self.retire(session);
        }
    }

    fn retire(&self, mut session: ShellSession) {
        session.close();
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    fn mark_broken(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, LifecycleState::Closing | LifecycleState::Closed) {
                return;
            }
            *state = LifecycleState::Broken;
        }
        self.permits.close();
    }

    /// Close every idle session and wake waiters so they retry elsewhere
    fn dispose(&self) {
        self.permits.close();
        let idle: Vec<ShellSession> = self.idle.lock().drain(..).collect();
        for session in idle {
            self.retire(session);
        }
        debug!(generation = self.generation, "Shell session pool disposed");
    }
}

/// Exclusive use of one session; returned to its pool on drop
#[derive(Debug)]
pub struct SessionLease {
    pool: Arc<SessionPool>,
    session: Option<ShellSession>,
    permit: Option<OwnedSemaphorePermit>,
    invalidated: bool,
}

impl SessionLease {
    /// Leased session id
    pub fn id(&self) -> u64 {
        self.session.as_ref().map_or(0, ShellSession::id)
    }

    /// Discard the session on release and mark its pool broken
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    /// Leased session
    pub fn session(&self) -> Option<&ShellSession> {
        self.session.as_ref()
    }

    pub(crate) fn session_mut(&mut self) -> Option<&mut ShellSession> {
        self.session.as_mut()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let broken = self.invalidated
                || std::thread::panicking()
                || session.state() == LifecycleState::Broken;
            self.pool.release(session, broken);
        }
        drop(self.permit.take());
    }
}

enum Step {
    Ready(Arc<SessionPool>),
    Open(Arc<SessionPool>),
    Wait,
}

/// Hands out shell sessions and recovers the pool behind them
#[derive(Debug)]
pub struct SessionPoolManager {
    config: SessionPoolConfig,
    globals: GlobalStore,
    modules: ModuleCatalog,
    host: HostInfo,
    limits: ScriptLimits,
    current: ArcSwapOption<SessionPool>,
    lifecycle: Mutex<()>,
    generations: AtomicU64,
    rebuilds: AtomicU64,
}

impl SessionPoolManager {
    /// Create a manager; the first pool opens on the first acquire
    pub fn new(
        config: SessionPoolConfig,
        globals: GlobalStore,
        modules: ModuleCatalog,
        host: HostInfo,
        limits: ScriptLimits,
    ) -> Self {
        Self {
            config,
            globals,
            modules,
            host,
            limits,
            current: ArcSwapOption::empty(),
            lifecycle: Mutex::new(()),
            generations: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &SessionPoolConfig {
        &self.config
    }

    pub(crate) fn limits(&self) -> &ScriptLimits {
        &self.limits
    }

    /// Lease a session, opening or rebuilding the pool as needed
    ///
    /// Waits while every session is leased, up to the configured timeout.
    pub async fn acquire(&self) -> Result<SessionLease> {
        loop {
            let pool = self.ready_pool().await;
            if let Some(lease) = pool.checkout(self.config.acquire_timeout).await? {
                return Ok(lease);
            }
        }
    }

    async fn ready_pool(&self) -> Arc<SessionPool> {
        loop {
            if let Some(pool) = self.current.load_full() {
                if pool.state() == LifecycleState::Opened {
                    return pool;
                }
            }

            let step = {
                let _guard = self.lifecycle.lock();
                match self.current.load_full() {
                    None => Step::Open(self.install_pool()),
                    Some(pool) => match pool.state() {
                        LifecycleState::Opened => Step::Ready(pool),
                        LifecycleState::BeforeOpen => {
                            pool.set_state(LifecycleState::Opening);
                            Step::Open(pool)
                        }
                        LifecycleState::Opening | LifecycleState::Closing => Step::Wait,
                        state @ (LifecycleState::Closed | LifecycleState::Broken) => {
                            pool.dispose();
                            self.rebuilds.fetch_add(1, Ordering::Relaxed);
                            info!(
                                generation = pool.generation,
                                %state,
                                "Rebuilding shell session pool"
                            );
                            Step::Open(self.install_pool())
                        }
                    },
                }
            };

            match step {
                Step::Ready(pool) => return pool,
                Step::Open(pool) => {
                    pool.open();
                    return pool;
                }
                Step::Wait => tokio::time::sleep(self.config.open_spin_interval).await,
            }
        }
    }

    /// Create and publish a pool already marked `Opening`; lifecycle lock held
    fn install_pool(&self) -> Arc<SessionPool> {
        let (min, max) = self.config.bounds();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let seed = SessionSeed {
            globals: self.globals.snapshot(),
            modules: self.modules.modules_for(ScriptLanguage::Shell),
            host: self.host.clone(),
            limits: self.limits.clone(),
        };
        let pool = Arc::new(SessionPool::new(generation, min, max, seed));
        pool.set_state(LifecycleState::Opening);
        self.current.store(Some(Arc::clone(&pool)));
        pool
    }

    /// Mark the current pool broken; the next acquire rebuilds it
    pub fn invalidate(&self) {
        let _guard = self.lifecycle.lock();
        if let Some(pool) = self.current.load_full() {
            pool.mark_broken();
        }
    }

    /// Close the current pool, waiting for leased sessions to come back
    pub async fn close(&self) {
        let pool = {
            let _guard = self.lifecycle.lock();
            match self.current.load_full() {
                Some(pool) if pool.state() != LifecycleState::Closed => {
                    pool.set_state(LifecycleState::Closing);
                    pool
                }
                _ => return,
            }
        };

        let permits = u32::try_from(pool.max).unwrap_or(u32::MAX);
        let drain = Arc::clone(&pool.permits).acquire_many_owned(permits);
        let wait = self.config.acquire_timeout.unwrap_or(Duration::from_secs(30));
        if tokio::time::timeout(wait, drain).await.is_err() {
            warn!(
                generation = pool.generation,
                in_use = pool.live.load(Ordering::Relaxed),
                "Closing shell session pool with sessions still leased"
            );
        }

        let _guard = self.lifecycle.lock();
        pool.dispose();
        pool.set_state(LifecycleState::Closed);
        info!(generation = pool.generation, "Shell session pool closed");
    }

    /// Current pool state; `BeforeOpen` before the first acquire
    pub fn state(&self) -> LifecycleState {
        self.current
            .load_full()
            .map_or(LifecycleState::BeforeOpen, |pool| pool.state())
    }

    /// Pool counters
    pub fn stats(&self) -> PoolStats {
        let (min, max) = self.config.bounds();
        let rebuilds = self.rebuilds.load(Ordering::Relaxed);
        match self.current.load_full() {
            Some(pool) => {
                let live = pool.live.load(Ordering::Relaxed);
                let idle = pool.idle.lock().len();
                PoolStats {
                    state: pool.state(),
                    generation: pool.generation,
                    min_sessions: pool.min,
                    max_sessions: pool.max,
                    live,
                    idle,
                    in_use: live.saturating_sub(idle),
                    checkouts: pool.checkouts.load(Ordering::Relaxed),
                    created: pool.created.load(Ordering::Relaxed),
                    rebuilds,
                }
            }
            None => PoolStats {
                state: LifecycleState::BeforeOpen,
                generation: 0,
                min_sessions: min,
                max_sessions: max,
                live: 0,
                idle: 0,
                in_use: 0,
                checkouts: 0,
                created: 0,
                rebuilds,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn manager(config: SessionPoolConfig) -> SessionPoolManager {
        SessionPoolManager::new(
            config,
            GlobalStore::new(),
            ModuleCatalog::new(),
            HostInfo::default(),
            ScriptLimits::default(),
        )
    }

    fn bounded(max: usize) -> SessionPoolConfig {
        SessionPoolConfig {
            min_sessions: 1,
            max_sessions: Some(max),
            ..SessionPoolConfig::default()
        }
    }

    #[test]
    fn test_bounds() {
        let config = SessionPoolConfig {
            min_sessions: 8,
            max_sessions: Some(3),
            ..SessionPoolConfig::default()
        };
        assert_eq!(config.bounds(), (3, 3));
        assert!(SessionPoolConfig::default().bounds().1 >= 2);
    }

    #[tokio::test]
    async fn test_lazy_open_and_reuse() {
        let manager = manager(bounded(2));
        assert_eq!(manager.state(), LifecycleState::BeforeOpen);

        let first = manager.acquire().await.unwrap();
        let id = first.id();
        assert_eq!(manager.state(), LifecycleState::Opened);
        drop(first);

        let second = manager.acquire().await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.session().unwrap().invocations(), 1);

        let stats = manager.stats();
        assert_eq!(stats.generation, 1);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.checkouts, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_holder_per_session() {
        let manager = Arc::new(manager(bounded(3)));
        let in_use = Arc::new(Mutex::new(HashSet::new()));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..24)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let in_use = Arc::clone(&in_use);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let lease = manager.acquire().await.unwrap();
                    {
                        let mut held = in_use.lock();
                        assert!(held.insert(lease.id()), "session leased twice");
                        peak.fetch_max(held.len(), Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_use.lock().remove(&lease.id());
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(manager.stats().created <= 3);
    }

    #[tokio::test]
    async fn test_broken_pool_rebuilds() {
        let manager = manager(bounded(2));
        let mut lease = manager.acquire().await.unwrap();
        lease.invalidate();
        drop(lease);
        assert_eq!(manager.state(), LifecycleState::Broken);

        let lease = manager.acquire().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Opened);
        let stats = manager.stats();
        assert_eq!(stats.generation, 2);
        assert_eq!(stats.rebuilds, 1);
        drop(lease);

        manager.invalidate();
        assert!(manager.acquire().await.is_ok());
        assert_eq!(manager.stats().rebuilds, 2);
    }

    #[tokio::test]
    async fn test_exhaustion_waits_then_times_out() {
        let manager = Arc::new(manager(SessionPoolConfig {
            acquire_timeout: Some(Duration::from_millis(50)),
            ..bounded(1)
        }));
        let held = manager.acquire().await.unwrap();

        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, ScriptError::SessionPool(_)));

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire().await.map(|lease| lease.id()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let id = held.id();
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn test_close_then_reopen() {
        let manager = manager(bounded(2));
        drop(manager.acquire().await.unwrap());
        manager.close().await;
        assert_eq!(manager.state(), LifecycleState::Closed);
        assert_eq!(manager.stats().live, 0);

        let _lease = manager.acquire().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Opened);
        assert_eq!(manager.stats().generation, 2);
    }
}
