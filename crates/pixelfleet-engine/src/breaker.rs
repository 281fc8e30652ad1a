use pixelfleet_common::config::BreakerConfig;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker state.
///
/// - **Closed**: normal operation, calls flow through
/// - **Open**: calls are rejected without reaching the worker until the
///   current reset timeout elapses
/// - **HalfOpen**: recovery test, one call admitted at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
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

/// Outcome of asking the breaker whether a call may proceed.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed; call normally.
    Allowed,
    /// Breaker half-open; this call is the single admitted probe.
    AllowedProbe,
    /// Breaker open; fail fast. `retry_in` is the remaining open time.
    Rejected { retry_in: Duration },
}

/// Serializable view of one breaker, for the operational endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub window_samples: usize,
    pub window_errors: usize,
    pub current_reset_timeout_ms: u64,
    /// Remaining open time in milliseconds, when open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    /// Single-admission latch for the half-open probe.
    probe_in_flight: bool,
    /// Rolling (timestamp, success) outcomes for the error-rate rule.
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    current_reset_timeout: Duration,
}

/// One circuit breaker guarding one worker operation class.
///
/// State, counters and the rolling window live behind a single mutex; no
/// operation suspends while holding it.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let current_reset_timeout = config.reset_timeout();
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                probe_in_flight: false,
                window: VecDeque::new(),
                opened_at: None,
                current_reset_timeout,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Asks whether a call may proceed, performing the OPEN -> HALF_OPEN
    /// transition when the reset timeout has elapsed.
    pub fn try_admit(&self) -> Admission {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= inner.current_reset_timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.probe_in_flight = true;
                    Admission::AllowedProbe
                } else {
                    Admission::Rejected {
                        retry_in: inner.current_reset_timeout - elapsed,
                    }
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    // Exactly one probe at a time.
                    Admission::Rejected {
                        retry_in: Duration::ZERO,
                    }
                } else {
                    inner.probe_in_flight = true;
                    Admission::AllowedProbe
                }
            }
        }
    }

    /// Non-mutating dispatchability check: anything but an un-elapsed OPEN
    /// state makes the worker a candidate.
    pub fn would_admit(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Open => inner
                .opened_at
                .map(|at| at.elapsed() >= inner.current_reset_timeout)
                .unwrap_or(true),
            _ => true,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.push_outcome(&mut inner, true);
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    self.transition(&mut inner, BreakerState::Closed);
                    inner.consecutive_failures = 0;
                    inner.current_reset_timeout = self.config.reset_timeout();
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.push_outcome(&mut inner, false);
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold
                    || self.window_tripped(&inner)
                {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                // Any half-open failure reopens with a grown timeout.
                inner.probe_in_flight = false;
                inner.current_reset_timeout = grow_timeout(
                    inner.current_reset_timeout,
                    self.config.max_reset_timeout(),
                );
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// Releases a granted probe without recording an outcome (the dispatch
    /// was abandoned before any call was made).
    pub fn cancel_probe(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Admin operation: trip the breaker regardless of counters.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != BreakerState::Open {
            self.transition(&mut inner, BreakerState::Open);
        }
    }

    /// Admin operation: close the breaker and reset counters.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed);
        }
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.probe_in_flight = false;
        inner.current_reset_timeout = self.config.reset_timeout();
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock().unwrap();
        self.prune_window(&mut inner);
        let retry_in_ms = match inner.state {
            BreakerState::Open => inner.opened_at.map(|at| {
                inner
                    .current_reset_timeout
                    .saturating_sub(at.elapsed())
                    .as_millis() as u64
            }),
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            window_samples: inner.window.len(),
            window_errors: inner.window.iter().filter(|(_, ok)| !ok).count(),
            current_reset_timeout_ms: inner.current_reset_timeout.as_millis() as u64,
            retry_in_ms,
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        match to {
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
                warn!(
                    breaker = %self.name,
                    from = from.as_str(),
                    to = to.as_str(),
                    retry_in_ms = inner.current_reset_timeout.as_millis() as u64,
                    "circuit breaker opened"
                );
            }
            BreakerState::HalfOpen => {
                inner.opened_at = None;
                inner.half_open_successes = 0;
                info!(
                    breaker = %self.name,
                    from = from.as_str(),
                    to = to.as_str(),
                    "circuit breaker half-open"
                );
            }
            BreakerState::Closed => {
                inner.opened_at = None;
                info!(
                    breaker = %self.name,
                    from = from.as_str(),
                    to = to.as_str(),
                    "circuit breaker closed"
                );
            }
        }
    }

    fn push_outcome(&self, inner: &mut BreakerInner, success: bool) {
        inner.window.push_back((Instant::now(), success));
        self.prune_window(inner);
    }

    fn prune_window(&self, inner: &mut BreakerInner) {
        let horizon = self.config.window();
        while let Some((at, _)) = inner.window.front() {
            if at.elapsed() > horizon {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Error-rate rule: trip when the window holds at least `volume_threshold`
    /// samples and the error share exceeds `error_threshold_pct`.
    fn window_tripped(&self, inner: &BreakerInner) -> bool {
        let total = inner.window.len();
        if total < self.config.volume_threshold {
            return false;
        }
        let errors = inner.window.iter().filter(|(_, ok)| !ok).count();
        (errors as f64 / total as f64) * 100.0 > self.config.error_threshold_pct
    }

    /// Test hook: pretend the breaker opened `by` ago.
    #[cfg(test)]
    pub(crate) fn backdate_open(&self, by: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(at) = inner.opened_at {
            inner.opened_at = Some(at - by);
        }
    }
}

fn grow_timeout(current: Duration, max: Duration) -> Duration {
    current.mul_f64(1.5).min(max)
}
