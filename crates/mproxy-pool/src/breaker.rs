//! Per-provider circuit breakers.
//!
//! Closed circuits trip open after `failure_threshold` consecutive
//! failures. Open circuits reject until their recovery deadline, then move
//! to half-open and admit a bounded number of probes; enough successes
//! close the circuit, any failure reopens it with a doubled (bounded)
//! timeout.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::key::epoch_now;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: f64,
    pub success_threshold: u32,
    pub max_timeout: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: 60.0,
            success_threshold: 2,
            max_timeout: 600.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum Inner {
    Closed {
        consecutive_failures: u32,
    },
    Open {
        until: f64,
        timeout: f64,
    },
    HalfOpen {
        successes: u32,
        probes: u32,
        timeout: f64,
    },
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        match *self.inner.lock().expect("breaker lock poisoned") {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Ask to send one request. Open circuits refuse; a circuit whose
    /// recovery deadline passed flips to half-open and admits a probe.
    pub fn try_acquire(&self) -> bool {
        let now = epoch_now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match *inner {
            Inner::Closed { .. } => true,
            Inner::Open { until, timeout } => {
                if now < until {
                    return false;
                }
                *inner = Inner::HalfOpen {
                    successes: 0,
                    probes: 1,
                    timeout,
                };
                true
            }
            Inner::HalfOpen {
                successes,
                probes,
                timeout,
            } => {
                if probes >= self.config.success_threshold {
                    return false;
                }
                *inner = Inner::HalfOpen {
                    successes,
                    probes: probes + 1,
                    timeout,
                };
                true
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match *inner {
            Inner::Closed { .. } => {
                *inner = Inner::Closed {
                    consecutive_failures: 0,
                };
            }
            Inner::HalfOpen {
                successes,
                probes,
                timeout,
            } => {
                let successes = successes + 1;
                if successes >= self.config.success_threshold {
                    *inner = Inner::Closed {
                        consecutive_failures: 0,
                    };
                } else {
                    *inner = Inner::HalfOpen {
                        successes,
                        probes,
                        timeout,
                    };
                }
            }
            Inner::Open { .. } => {}
        }
    }

    pub fn on_failure(&self) {
        let now = epoch_now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match *inner {
            Inner::Closed {
                consecutive_failures,
            } => {
                let consecutive_failures = consecutive_failures + 1;
                if consecutive_failures >= self.config.failure_threshold {
                    let timeout = self.config.recovery_timeout;
                    *inner = Inner::Open {
                        until: now + timeout,
                        timeout,
                    };
                    tracing::warn!(timeout, "circuit opened");
                } else {
                    *inner = Inner::Closed {
                        consecutive_failures,
                    };
                }
            }
            Inner::HalfOpen { timeout, .. } => {
                let timeout = (timeout * 2.0).min(self.config.max_timeout);
                *inner = Inner::Open {
                    until: now + timeout,
                    timeout,
                };
                tracing::warn!(timeout, "circuit reopened after failed probe");
            }
            Inner::Open { .. } => {}
        }
    }
}

/// Lazily created breaker per provider.
pub struct BreakerSet {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, std::sync::Arc<CircuitBreaker>>>,
}

impl BreakerSet {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn breaker(&self, provider: &str) -> std::sync::Arc<CircuitBreaker> {
        let mut guard = self.breakers.lock().expect("breaker set lock poisoned");
        guard
            .entry(provider.to_string())
            .or_insert_with(|| std::sync::Arc::new(CircuitBreaker::new(self.config)))
            .clone()
    }
}

impl Default for BreakerSet {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
