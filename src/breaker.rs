//! Failure-rate circuit breaker.
//!
//! One breaker guards each connection pool (one per protocol, not per
//! device): a site-wide outage trips once instead of N times. The breaker
//! opens when the failure rate over a sliding window of recent calls
//! crosses the threshold, fails fast while open, and admits a single
//! probe after the cool-down.

use crate::error::{ProtocolError, ProtocolResult};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Number of most-recent calls considered for the failure rate.
    pub window: usize,
    /// Minimum calls in the window before the breaker may trip.
    pub min_requests: usize,
    /// Failure ratio at or above which the breaker opens.
    pub failure_rate: f64,
    /// How long the breaker stays open before admitting a probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            window: 10,
            min_requests: 5,
            failure_rate: 0.6,
            cooldown: Duration::from_secs(30),
        }
    }
}

struct Inner {
    state: BreakerState,
    results: VecDeque<bool>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                results: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Gate a call. `Ok` means the caller may proceed and must report the
    /// outcome via [`record`](Self::record); `Err(CircuitOpen)` means fail
    /// fast without touching the transport.
    pub fn try_acquire(&self) -> ProtocolResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    info!(breaker = %self.name, "circuit breaker half-open, admitting probe");
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(ProtocolError::CircuitOpen)
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(ProtocolError::CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Report the outcome of a call admitted by
    /// [`try_acquire`](Self::try_acquire).
    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                if success {
                    info!(breaker = %self.name, "probe succeeded, circuit breaker closed");
                    inner.state = BreakerState::Closed;
                    inner.results.clear();
                    inner.opened_at = None;
                } else {
                    warn!(breaker = %self.name, "probe failed, circuit breaker reopened");
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Closed => {
                inner.results.push_back(success);
                while inner.results.len() > self.config.window {
                    inner.results.pop_front();
                }
                if inner.results.len() >= self.config.min_requests {
                    let failures = inner.results.iter().filter(|ok| !**ok).count();
                    let rate = failures as f64 / inner.results.len() as f64;
                    if rate >= self.config.failure_rate {
                        warn!(
                            breaker = %self.name,
                            failures = failures,
                            window = inner.results.len(),
                            "failure rate threshold crossed, circuit breaker opened"
                        );
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                        inner.results.clear();
                    }
                }
            }
            // A late completion from before the trip; the window was
            // already discarded.
            BreakerState::Open => {}
        }
    }

    /// Run `fut` under the breaker, recording its outcome.
    pub async fn call<T, F>(&self, fut: F) -> ProtocolResult<T>
    where
        F: std::future::Future<Output = ProtocolResult<T>>,
    {
        self.try_acquire()?;
        let result = fut.await;
        self.record(result.is_ok());
        result
    }
}
