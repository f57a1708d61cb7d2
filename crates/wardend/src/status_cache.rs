//! Status Cache.
//!
//! Time-bounded cache of the aggregate host status. Owned by the orchestrator and
//! shared by handle; the clock is injected so expiry can be tested without sleeping.
//!
//! Invalidation bumps a generation counter. A snapshot whose computation started
//! before an `invalidate()` is returned to its caller but never stored, so no reader
//! observes pre-mutation data after the mutation finished.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use warden_shared::{HostStatus, WardenResult};

/// Produces a fresh snapshot by probing the host
#[async_trait]
pub trait StatusCollector: Send + Sync {
    async fn collect(&self) -> WardenResult<HostStatus>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner()) += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct CacheState {
    entry: Option<(Instant, Arc<HostStatus>)>,
    generation: u64,
}

pub struct StatusCache {
    collector: Arc<dyn StatusCollector>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl StatusCache {
    pub fn new(collector: Arc<dyn StatusCollector>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            collector,
            clock,
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached snapshot if younger than the TTL, else a fresh one.
    pub async fn get(&self, force_refresh: bool) -> WardenResult<Arc<HostStatus>> {
        let generation = {
            let state = self.state();
            if !force_refresh {
                if let Some((at, snapshot)) = &state.entry {
                    if self.clock.now().saturating_duration_since(*at) < self.ttl {
                        debug!("Status cache hit");
                        return Ok(snapshot.clone());
                    }
                }
            }
            state.generation
        };

        debug!("Status cache miss (forced: {})", force_refresh);
        let fresh = Arc::new(self.collector.collect().await?);

        let mut state = self.state();
        if state.generation == generation {
            state.entry = Some((self.clock.now(), fresh.clone()));
        }
        Ok(fresh)
    }

    pub fn invalidate(&self) {
        let mut state = self.state();
        state.entry = None;
        state.generation += 1;
        debug!("Status cache invalidated");
    }

    pub fn is_cached(&self) -> bool {
        self.state().entry.is_some()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
