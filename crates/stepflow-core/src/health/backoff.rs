//! Retry with backoff plus circuit-style cool-off for periodic operations.
//!
//! A `BackoffController` wraps an operation such as a health probe or a
//! metrics scrape. Each `run` retries the operation up to `max_attempts`
//! times, sleeping `base_delay_ms` between attempts. Consecutive failures
//! accumulate across runs; once they reach `cool_off_threshold` the
//! controller cools off and fails fast for `cool_off_duration_ms` without
//! invoking the operation.
//!
//! State machine:
//!
//! ```text
//! Healthy { n } --failure, n+1 < threshold--> Healthy { n+1 }
//! Healthy { n } --failure, n+1 >= threshold--> CoolingOff { until }
//! CoolingOff   --window elapsed, next run-->  Healthy { 0 }
//! any          --success-->                   Healthy { 0 }
//! ```
//!
//! Lifecycle events go to the shared [`EventBus`].

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use stepflow_types::config::BackoffConfig;
use stepflow_types::event::EngineEvent;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::event::bus::EventBus;

/// What a successful `run` produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome<T> {
    /// The operation ran and succeeded.
    Completed(T),
    /// The sample-rate gate skipped this call; the operation was not invoked.
    Sampled,
}

impl<T> RunOutcome<T> {
    pub fn into_completed(self) -> Option<T> {
        match self {
            RunOutcome::Completed(v) => Some(v),
            RunOutcome::Sampled => None,
        }
    }
}

/// Why a `run` did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum BackoffError<E> {
    #[error("cooling off for another {remaining_ms}ms")]
    CoolingOff { remaining_ms: u64 },

    #[error("backoff controller is paused")]
    Paused,

    #[error("gave up after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    #[error("cool-off entered after repeated failures: {last_error}")]
    CoolOffEntered { last_error: E },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoolOffState {
    Healthy { consecutive_failures: u32 },
    CoolingOff { until: Instant },
}

/// Point-in-time view of a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffStatus {
    pub source: String,
    /// While cooling off this equals the threshold that triggered it.
    pub consecutive_failures: u32,
    pub cooling_off: bool,
    pub cool_off_remaining_ms: Option<u64>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub paused: bool,
}

/// Retry/backoff and cool-off wrapper around a fallible async operation.
pub struct BackoffController {
    source: String,
    config: BackoffConfig,
    events: EventBus,
    state: Mutex<CoolOffState>,
    last_error: Mutex<Option<String>>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    paused: watch::Sender<bool>,
}

impl std::fmt::Debug for BackoffController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffController")
            .field("source", &self.source)
            .field("config", &self.config)
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

impl BackoffController {
    /// `source` names the wrapped operation in events and logs.
    pub fn new(source: impl Into<String>, config: BackoffConfig, events: EventBus) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            source: source.into(),
            config: config.normalized(),
            events,
            state: Mutex::new(CoolOffState::Healthy {
                consecutive_failures: 0,
            }),
            last_error: Mutex::new(None),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            paused,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Run `operation` under the retry, cool-off and sampling rules.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<RunOutcome<T>, BackoffError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if self.is_paused() {
            return Err(BackoffError::Paused);
        }

        let fully_healthy = {
            let mut state = self.state.lock().await;
            match *state {
                CoolOffState::CoolingOff { until } => {
                    let now = Instant::now();
                    if now < until {
                        return Err(BackoffError::CoolingOff {
                            remaining_ms: (until - now).as_millis() as u64,
                        });
                    }
                    *state = CoolOffState::Healthy {
                        consecutive_failures: 0,
                    };
                    tracing::info!(source = self.source.as_str(), "cool-off window elapsed");
                    self.events.publish(EngineEvent::CoolOffExited {
                        source: self.source.clone(),
                    });
                    true
                }
                CoolOffState::Healthy {
                    consecutive_failures,
                } => consecutive_failures == 0,
            }
        };

        if fully_healthy
            && self.config.sample_rate < 1.0
            && rand::random::<f64>() >= self.config.sample_rate
        {
            tracing::trace!(source = self.source.as_str(), "call skipped by sample rate");
            return Ok(RunOutcome::Sampled);
        }

        let max_attempts = self.config.max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.total_calls.fetch_add(1, Ordering::Relaxed);
            self.events.publish(EngineEvent::BackoffAttempt {
                source: self.source.clone(),
                attempt,
            });

            let error = match operation().await {
                Ok(value) => {
                    *self.state.lock().await = CoolOffState::Healthy {
                        consecutive_failures: 0,
                    };
                    return Ok(RunOutcome::Completed(value));
                }
                Err(e) => e,
            };

            self.total_failures.fetch_add(1, Ordering::Relaxed);
            let message = error.to_string();
            *self.last_error.lock().await = Some(message.clone());

            let (failures, entered) = {
                let mut state = self.state.lock().await;
                match *state {
                    CoolOffState::Healthy {
                        consecutive_failures,
                    } => {
                        let failures = consecutive_failures + 1;
                        if failures >= self.config.cool_off_threshold {
                            *state = CoolOffState::CoolingOff {
                                until: Instant::now()
                                    + Duration::from_millis(self.config.cool_off_duration_ms),
                            };
                            (failures, true)
                        } else {
                            *state = CoolOffState::Healthy {
                                consecutive_failures: failures,
                            };
                            (failures, false)
                        }
                    }
                    // A concurrent run already tripped the cool-off.
                    CoolOffState::CoolingOff { .. } => {
                        drop(state);
                        return Err(BackoffError::Exhausted {
                            attempts: attempt,
                            last_error: error,
                        });
                    }
                }
            };

            tracing::debug!(
                source = self.source.as_str(),
                attempt,
                consecutive_failures = failures,
                error = message.as_str(),
                "operation failed"
            );
            self.events.publish(EngineEvent::BackoffFailure {
                source: self.source.clone(),
                attempt,
                consecutive_failures: failures,
                error: message,
            });

            if entered {
                tracing::warn!(
                    source = self.source.as_str(),
                    consecutive_failures = failures,
                    duration_ms = self.config.cool_off_duration_ms,
                    "entering cool-off"
                );
                self.events.publish(EngineEvent::CoolOffEntered {
                    source: self.source.clone(),
                    duration_ms: self.config.cool_off_duration_ms,
                });
                return Err(BackoffError::CoolOffEntered { last_error: error });
            }
            if attempt >= max_attempts {
                return Err(BackoffError::Exhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }

            let mut paused = self.paused.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.config.base_delay_ms)) => {}
                _ = wait_paused(&mut paused) => return Err(BackoffError::Paused),
            }
        }
    }

    /// Run `operation` every `interval` until the controller is paused.
    ///
    /// Failures are logged and do not stop the loop; a paused controller
    /// ends it. After `resume`, spawn a new loop.
    pub fn spawn_periodic<T, E, F, Fut>(self: &Arc<Self>, interval: Duration, mut operation: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut paused = controller.paused.subscribe();
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(source = controller.source.as_str(), ?interval, "periodic run started");

            loop {
                tokio::select! {
                    _ = wait_paused(&mut paused) => break,
                    _ = ticker.tick() => {}
                }
                match controller.run(&mut operation).await {
                    Ok(_) => {}
                    Err(BackoffError::Paused) => break,
                    Err(BackoffError::CoolingOff { remaining_ms }) => {
                        tracing::trace!(source = controller.source.as_str(), remaining_ms, "still cooling off");
                    }
                    Err(e) => {
                        tracing::warn!(source = controller.source.as_str(), error = %e, "periodic run failed");
                    }
                }
            }

            tracing::debug!(source = controller.source.as_str(), "periodic run stopped");
        })
    }

    /// Stop all activity: new runs fail with `Paused`, in-progress delays
    /// abort, and periodic loops exit.
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            tracing::info!(source = self.source.as_str(), "backoff controller paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            tracing::info!(source = self.source.as_str(), "backoff controller resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub async fn status(&self) -> BackoffStatus {
        let state = *self.state.lock().await;
        let now = Instant::now();
        let (consecutive_failures, remaining) = match state {
            CoolOffState::Healthy {
                consecutive_failures,
            } => (consecutive_failures, None),
            CoolOffState::CoolingOff { until } => (
                self.config.cool_off_threshold,
                (now < until).then(|| (until - now).as_millis() as u64),
            ),
        };
        BackoffStatus {
            source: self.source.clone(),
            consecutive_failures,
            cooling_off: remaining.is_some(),
            cool_off_remaining_ms: remaining,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            last_error: self.last_error.lock().await.clone(),
            paused: self.is_paused(),
        }
    }
}

/// Resolves once the pause flag is set.
async fn wait_paused(paused: &mut watch::Receiver<bool>) {
    let _ = paused.wait_for(|p| *p).await;
}
