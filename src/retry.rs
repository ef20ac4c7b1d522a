//! # Retries and Error Handlers
//!
//! Failures are absorbed at two levels:
//!
//! 1. **In-node attempts.** [`RetryMode`] on a [`crate::NodeConfig`] re-runs an executor
//!    inside the same claim before anything is recorded ([`run_with_retries`]).
//! 2. **Error handlers.** Once a node gives up, its contexts are parked in `ERROR` and the
//!    node's [`ErrorHandler`] (or the flow's) is consulted. The handler may patch the
//!    contexts and return [`ErrorDecision::Retry`]; the engine then moves them back to
//!    `READY`, optionally after a delay.
//!
//! Engine errors (illegal transitions, missing branches) never reach a handler.
//!
//! ```rust
//! use waterflow::retry::{ErrorDecision, FnErrorHandler, RetryDecision};
//! use waterflow::{FlowContext, FlowError};
//!
//! // Patch the payload and try again right away.
//! let handler = FnErrorHandler::new(|_err: &FlowError, mut contexts: Vec<FlowContext<i32>>| {
//!     for ctx in &mut contexts {
//!         *ctx.data_mut() = 0;
//!     }
//!     ErrorDecision::Retry(RetryDecision::now(contexts))
//! });
//! # let _ = handler;
//! ```

use crate::context::FlowContext;
use crate::error::{FlowError, FlowResult};
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{Instrument, debug, error, info_span, warn};

/// Retry modes for in-node attempts and [`RetryHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryMode {
    /// No retries - fail immediately on first error
    None,

    /// Fixed number of retries with constant delay
    Fixed { retries: usize, delay: Duration },

    /// Exponential backoff with optional jitter
    ///
    /// delay = base_delay * multiplier^attempt, capped at `max_delay`, then scaled by
    /// `1 ± jitter`.
    ExponentialBackoff {
        max_retries: usize,
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
        jitter: f64,
    },
}

impl RetryMode {
    /// Create a fixed retry mode with specified retries and delay
    pub fn fixed(retries: usize, delay: Duration) -> Self {
        Self::Fixed { retries, delay }
    }

    /// Exponential backoff with base 100ms, multiplier 2.0, cap 30s and 10% jitter
    pub fn exponential(max_retries: usize) -> Self {
        Self::ExponentialBackoff {
            max_retries,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }

    pub fn exponential_custom(
        max_retries: usize,
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
        jitter: f64,
    ) -> Self {
        Self::ExponentialBackoff {
            max_retries,
            base_delay,
            multiplier,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Initial attempt plus retries
    pub fn max_attempts(&self) -> usize {
        match self {
            Self::None => 1,
            Self::Fixed { retries, .. } => retries + 1,
            Self::ExponentialBackoff { max_retries, .. } => max_retries + 1,
        }
    }

    /// Delay before retry number `attempt` (0-based), or `None` once retries are spent.
    pub fn delay_for_attempt(&self, attempt: usize) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed { retries, delay } => (attempt < *retries).then_some(*delay),
            Self::ExponentialBackoff {
                max_retries,
                base_delay,
                multiplier,
                max_delay,
                jitter,
            } => {
                if attempt >= *max_retries {
                    return None;
                }
                let base_ms = base_delay.as_millis() as f64;
                let capped = (base_ms * multiplier.powi(attempt as i32))
                    .min(max_delay.as_millis() as f64);
                let factor = if *jitter > 0.0 {
                    let spread: f64 = rand::rng().random_range(-1.0..=1.0);
                    1.0 + jitter * spread
                } else {
                    1.0
                };
                Some(Duration::from_millis((capped * factor).max(0.0) as u64))
            }
        }
    }
}

impl Default for RetryMode {
    fn default() -> Self {
        Self::None
    }
}

/// Run `run_fn` until it succeeds or `mode` runs out of attempts.
pub async fn run_with_retries<T, F, Fut>(mode: &RetryMode, run_fn: F) -> FlowResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = FlowResult<T>>,
{
    let max_attempts = mode.max_attempts();
    let mut attempt = 0;

    loop {
        let span = info_span!("node_attempt", attempt = attempt + 1, max_attempts);
        match run_fn().instrument(span).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                // Engine errors are deterministic; repeating them is pointless.
                if attempt >= max_attempts || e.is_engine_error() {
                    error!(error = %e, final_attempt = attempt, max_attempts, "Node attempts exhausted");
                    return Err(e);
                }
                warn!(error = %e, attempt, max_attempts, "Node attempt failed, will retry");

                if let Some(delay) = mode.delay_for_attempt(attempt - 1) {
                    debug!(delay_ms = delay.as_millis() as u64, "Waiting before retry");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Contexts to put back to `READY`, optionally after `delay`.
#[derive(Debug, Clone)]
pub struct RetryDecision<D> {
    pub contexts: Vec<FlowContext<D>>,
    pub delay: Option<Duration>,
}

impl<D> RetryDecision<D> {
    pub fn now(contexts: Vec<FlowContext<D>>) -> Self {
        Self {
            contexts,
            delay: None,
        }
    }

    pub fn after(contexts: Vec<FlowContext<D>>, delay: Duration) -> Self {
        Self {
            contexts,
            delay: Some(delay),
        }
    }
}

/// What an [`ErrorHandler`] wants done with failed contexts.
#[derive(Debug, Clone)]
pub enum ErrorDecision<D> {
    Retry(RetryDecision<D>),
    /// Leave the contexts in `ERROR` and report the failure to the flow's close callback.
    Terminate,
}

/// Decides what happens to contexts a node could not process.
///
/// `contexts` are the failed contexts, already in `ERROR` with their fault recorded.
/// Patch payloads or scratch values on them before handing them back in a retry.
#[async_trait]
pub trait ErrorHandler<D>: Send + Sync {
    async fn handle(&self, error: &FlowError, contexts: Vec<FlowContext<D>>) -> ErrorDecision<D>;
}

/// Adapts a closure into an [`ErrorHandler`].
pub struct FnErrorHandler<F> {
    f: F,
}

impl<F> FnErrorHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<D, F> ErrorHandler<D> for FnErrorHandler<F>
where
    D: Send + Sync + 'static,
    F: Fn(&FlowError, Vec<FlowContext<D>>) -> ErrorDecision<D> + Send + Sync,
{
    async fn handle(&self, error: &FlowError, contexts: Vec<FlowContext<D>>) -> ErrorDecision<D> {
        (self.f)(error, contexts)
    }
}

/// Retries failed contexts unchanged while `mode` still yields a delay.
///
/// The retry count comes from the contexts' own attempt counters, so the budget holds
/// across workers and process restarts.
#[derive(Debug, Clone)]
pub struct RetryHandler {
    mode: RetryMode,
}

impl RetryHandler {
    pub fn new(mode: RetryMode) -> Self {
        Self { mode }
    }
}

#[async_trait]
impl<D: Send + Sync + 'static> ErrorHandler<D> for RetryHandler {
    async fn handle(&self, error: &FlowError, contexts: Vec<FlowContext<D>>) -> ErrorDecision<D> {
        let attempt = contexts.iter().map(|c| c.attempt()).max().unwrap_or(0) as usize;
        match self.mode.delay_for_attempt(attempt) {
            Some(delay) => {
                debug!(error = %error, attempt, delay_ms = delay.as_millis() as u64, "Retrying failed contexts");
                ErrorDecision::Retry(RetryDecision::after(contexts, delay))
            }
            None => ErrorDecision::Terminate,
        }
    }
}
