//! Rate Governor: per-provider concurrency limiting plus circuit
//! breaking. Holds one `tokio::sync::Semaphore` per provider tag, built
//! from `ModelsFile::provider_limits`, paired with a closed/open/
//! half_open circuit breaker so a consistently failing provider stops
//! taking new calls instead of queuing behind a dead backend.

use crate::error::{Result, StoryBenchError};
use crate::model::ProviderLimits;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

/// Circuit breaker state for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    failure_threshold: u32,
    open_duration: Duration,
    opened_at: Option<Instant>,
    half_open_probe_in_flight: bool,
}

impl Breaker {
    fn new(limits: &ProviderLimits) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            failure_threshold: limits.failure_threshold.max(1),
            open_duration: limits.open_duration(),
            opened_at: None,
            half_open_probe_in_flight: false,
        }
    }

    /// Returns `Err` if the circuit refuses entry, `Ok(is_half_open_probe)`
    /// otherwise.
    fn try_enter(&mut self, provider_tag: &str) -> Result<bool> {
        match self.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or_else(Instant::now);
                if opened_at.elapsed() >= self.open_duration {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_probe_in_flight = true;
                    debug!(provider_tag, "circuit transitioning to half_open");
                    Ok(true)
                } else {
                    let reopen_at_epoch_ms = epoch_ms_at(opened_at + self.open_duration);
                    Err(StoryBenchError::CircuitOpen {
                        provider_tag: provider_tag.to_string(),
                        reopen_at_epoch_ms,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_probe_in_flight {
                    let reopen_at_epoch_ms = epoch_ms_at(Instant::now());
                    Err(StoryBenchError::CircuitOpen {
                        provider_tag: provider_tag.to_string(),
                        reopen_at_epoch_ms,
                    })
                } else {
                    self.half_open_probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn record_success(&mut self, provider_tag: &str) {
        self.consecutive_failures = 0;
        self.half_open_probe_in_flight = false;
        if self.state != CircuitState::Closed {
            debug!(provider_tag, "circuit closing after successful probe");
        }
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }

    fn record_failure(&mut self, provider_tag: &str) {
        self.half_open_probe_in_flight = false;
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    warn!(provider_tag, threshold = self.failure_threshold, "circuit opening");
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(provider_tag, "half_open probe failed, circuit reopening");
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }
}

fn epoch_ms_at(instant: Instant) -> u64 {
    let now_instant = Instant::now();
    let now_epoch_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
    if instant >= now_instant {
        now_epoch_ms.saturating_add((instant - now_instant).as_millis() as u64)
    } else {
        now_epoch_ms.saturating_sub((now_instant - instant).as_millis() as u64)
    }
}

struct ProviderGate {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    breaker: Mutex<Breaker>,
}

/// A held rate-limit permit. Dropping it without calling
/// [`RateGovernor::record_outcome`] is treated as a failure, since a
/// worker that panics mid-call should still trip the breaker.
pub struct Permit<'a> {
    _semaphore_permit: SemaphorePermit<'a>,
    provider_tag: String,
    is_half_open_probe: bool,
    outcome_recorded: bool,
}

impl Permit<'_> {
    /// Whether this call was admitted as a half-open circuit probe.
    #[must_use]
    pub fn is_half_open_probe(&self) -> bool {
        self.is_half_open_probe
    }
}

/// Per-provider concurrency and circuit-breaker governance.
pub struct RateGovernor {
    providers: HashMap<String, ProviderGate>,
}

impl RateGovernor {
    /// Build a governor from the declared provider limits. Providers not
    /// listed default to a concurrency of `1` and the default breaker
    /// thresholds in [`ProviderLimits`].
    #[must_use]
    pub fn new(limits: &[ProviderLimits]) -> Self {
        let providers = limits
            .iter()
            .map(|limits| {
                let gate = ProviderGate {
                    semaphore: Arc::new(Semaphore::new(limits.max_concurrency.max(1))),
                    max_concurrency: limits.max_concurrency.max(1),
                    breaker: Mutex::new(Breaker::new(limits)),
                };
                (limits.provider_tag.clone(), gate)
            })
            .collect();
        Self { providers }
    }

    fn gate(&self, provider_tag: &str) -> Result<&ProviderGate> {
        self.providers.get(provider_tag).ok_or_else(|| {
            StoryBenchError::Configuration(format!(
                "no provider_limits declared for provider '{provider_tag}'"
            ))
        })
    }

    /// Acquire a permit to call the given provider, blocking until
    /// concurrency capacity is available. Returns
    /// [`StoryBenchError::CircuitOpen`] immediately if the breaker refuses
    /// entry, without waiting on the semaphore — an open circuit should
    /// fail fast, not queue behind it.
    pub async fn acquire(&self, provider_tag: &str) -> Result<Permit<'_>> {
        let gate = self.gate(provider_tag)?;
        let is_half_open_probe = gate.breaker.lock().try_enter(provider_tag)?;
        let semaphore_permit = gate
            .semaphore
            .acquire()
            .await
            .map_err(|_| StoryBenchError::Cancelled)?;
        Ok(Permit {
            _semaphore_permit: semaphore_permit,
            provider_tag: provider_tag.to_string(),
            is_half_open_probe,
            outcome_recorded: false,
        })
    }

    /// Non-blocking variant: returns
    /// [`StoryBenchError::RateCapacityUnavailable`] instead of waiting.
    pub fn try_acquire(&self, provider_tag: &str) -> Result<Permit<'_>> {
        let gate = self.gate(provider_tag)?;
        let is_half_open_probe = gate.breaker.lock().try_enter(provider_tag)?;
        let semaphore_permit = gate.semaphore.try_acquire().map_err(|_| {
            StoryBenchError::RateCapacityUnavailable(provider_tag.to_string())
        })?;
        Ok(Permit {
            _semaphore_permit: semaphore_permit,
            provider_tag: provider_tag.to_string(),
            is_half_open_probe,
            outcome_recorded: false,
        })
    }

    /// Record whether the call made under `permit` succeeded, updating the
    /// breaker state. Must be called exactly once per permit.
    pub fn record_outcome(&self, mut permit: Permit<'_>, succeeded: bool) {
        if let Some(gate) = self.providers.get(&permit.provider_tag) {
            let mut breaker = gate.breaker.lock();
            if succeeded {
                breaker.record_success(&permit.provider_tag);
            } else {
                breaker.record_failure(&permit.provider_tag);
            }
        }
        permit.outcome_recorded = true;
    }

    /// Currently available concurrency slots for a provider, for
    /// diagnostics and the progress monitor.
    #[must_use]
    pub fn available_permits(&self, provider_tag: &str) -> Option<usize> {
        self.providers
            .get(provider_tag)
            .map(|gate| gate.semaphore.available_permits())
    }

    /// Declared max concurrency for a provider.
    #[must_use]
    pub fn max_concurrency(&self, provider_tag: &str) -> Option<usize> {
        self.providers.get(provider_tag).map(|gate| gate.max_concurrency)
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.outcome_recorded {
            warn!(
                provider_tag = %self.provider_tag,
                "permit dropped without recording an outcome; treat as caller bug"
            );
        }
    }
}
