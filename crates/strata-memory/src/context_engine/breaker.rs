//! Circuit breakers - failure isolation per (layer, store) pair
//!
//! Every layer gets an independent breaker for each backing store, so a
//! wedged vector index on one layer never blocks structured reads on
//! another. Time-dependent methods take an explicit `Instant` so tests can
//! drive the clock; the registry wrappers pass `Instant::now()`.

use crate::memory_db::schema::MemoryLayer;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Which backing store a breaker guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StoreKind {
    Structured,
    Vector,
    Analytics,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Structured => "structured",
            StoreKind::Vector => "vector",
            StoreKind::Analytics => "analytics",
        }
    }
}

pub type BreakerKey = (MemoryLayer, StoreKind);

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures within the window that trip the breaker.
    pub failure_threshold: u32,
    /// Window within which failures count as consecutive.
    pub failure_window: Duration,
    /// Base cooldown before a tripped breaker admits a trial call.
    pub cooldown: Duration,
    /// Ceiling for the doubling cooldown.
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let current_cooldown = config.cooldown;
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            window_start: None,
            opened_at: None,
            current_cooldown,
        }
    }

    /// Whether a call may proceed. An Open breaker whose cooldown has
    /// elapsed flips to HalfOpen and admits exactly this one trial call;
    /// further calls are refused until the trial reports back.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.current_cooldown {
                    self.state = BreakerState::HalfOpen;
                    debug!("breaker half-open, admitting trial call");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => false,
        }
    }

    pub fn on_success(&mut self, _now: Instant) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Closed;
                self.consecutive_failures = 0;
                self.window_start = None;
                self.opened_at = None;
                self.current_cooldown = self.config.cooldown;
                info!("breaker closed after successful trial");
            }
            BreakerState::Closed => {
                self.consecutive_failures = 0;
                self.window_start = None;
            }
            // A straggler from before the trip. The cooldown stands.
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&mut self, now: Instant) {
        match self.state {
            BreakerState::Closed => {
                let in_window = self
                    .window_start
                    .map(|start| now.duration_since(start) <= self.config.failure_window)
                    .unwrap_or(false);
                if in_window {
                    self.consecutive_failures += 1;
                } else {
                    self.window_start = Some(now);
                    self.consecutive_failures = 1;
                }
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                    warn!(
                        failures = self.consecutive_failures,
                        cooldown_secs = self.current_cooldown.as_secs(),
                        "breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                self.current_cooldown =
                    (self.current_cooldown * 2).min(self.config.max_cooldown);
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
                warn!(
                    cooldown_secs = self.current_cooldown.as_secs(),
                    "trial call failed, breaker reopened"
                );
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Trip immediately, regardless of failure history.
    pub fn force_open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
    }
}

/// All breakers for one engine instance. Keys are created lazily; a pair
/// that never failed reads as Closed.
pub struct BreakerRegistry {
    breakers: DashMap<BreakerKey, Mutex<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    fn with<R>(&self, layer: MemoryLayer, store: StoreKind, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let entry = self
            .breakers
            .entry((layer, store))
            .or_insert_with(|| Mutex::new(CircuitBreaker::new(self.config.clone())));
        let mut breaker = entry.lock().unwrap();
        f(&mut breaker)
    }

    pub fn allow(&self, layer: MemoryLayer, store: StoreKind) -> bool {
        self.allow_at(layer, store, Instant::now())
    }

    pub fn allow_at(&self, layer: MemoryLayer, store: StoreKind, now: Instant) -> bool {
        self.with(layer, store, |b| b.allow(now))
    }

    pub fn on_success(&self, layer: MemoryLayer, store: StoreKind) {
        self.on_success_at(layer, store, Instant::now());
    }

    pub fn on_success_at(&self, layer: MemoryLayer, store: StoreKind, now: Instant) {
        self.with(layer, store, |b| b.on_success(now));
    }

    pub fn on_failure(&self, layer: MemoryLayer, store: StoreKind) {
        self.on_failure_at(layer, store, Instant::now());
    }

    pub fn on_failure_at(&self, layer: MemoryLayer, store: StoreKind, now: Instant) {
        self.with(layer, store, |b| {
            b.on_failure(now);
            if b.state() == BreakerState::Open {
                warn!(
                    layer = layer.as_str(),
                    store = store.as_str(),
                    "circuit open"
                );
            }
        });
    }

    pub fn state(&self, layer: MemoryLayer, store: StoreKind) -> BreakerState {
        self.breakers
            .get(&(layer, store))
            .map(|entry| entry.lock().unwrap().state())
            .unwrap_or(BreakerState::Closed)
    }

    /// Operator/test override that trips one breaker immediately.
    pub fn force_open(&self, layer: MemoryLayer, store: StoreKind) {
        self.with(layer, store, |b| b.force_open(Instant::now()));
    }

    /// Current state of every breaker that has been touched.
    pub fn snapshot(&self) -> Vec<(BreakerKey, BreakerState)> {
        let mut states: Vec<(BreakerKey, BreakerState)> = self
            .breakers
            .iter()
            .map(|entry| (*entry.key(), entry.value().lock().unwrap().state()))
            .collect();
        states.sort_by_key(|((layer, store), _)| (layer.as_str(), store.as_str()));
        states
    }
}
