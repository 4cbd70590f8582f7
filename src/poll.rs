//! Polling strategy for submitted calls.
//!
//! A strategy instance is stateful (intervals, elapsed budget) and
//! belongs to exactly one call; sharing one across calls would let one
//! call's progress starve another's polling. The engine creates a fresh
//! instance per call through [`PollStrategyFactory`].

use backoff::backoff::Backoff;
use std::sync::Arc;
use std::time::Duration;

/// Decides how long to wait before the next poll of a submitted request.
pub trait PollStrategy: Send {
    /// Delay before the next poll, or `None` to give up.
    fn next_poll_delay(&mut self) -> Option<Duration>;
}

/// Creates one [`PollStrategy`] per call.
pub trait PollStrategyFactory: Send + Sync {
    fn create(&self) -> Box<dyn PollStrategy>;
}

impl<F> PollStrategyFactory for F
where
    F: Fn() -> Box<dyn PollStrategy> + Send + Sync,
{
    fn create(&self) -> Box<dyn PollStrategy> {
        self()
    }
}

/// The default factory: [`ExponentialBackoff`] with default parameters.
pub fn default_factory() -> Arc<dyn PollStrategyFactory> {
    Arc::new(|| Box::new(ExponentialBackoff::default()) as Box<dyn PollStrategy>)
}

/// Exponential backoff over [`backoff::ExponentialBackoff`], capped per
/// interval and in total elapsed time since the first poll. Jitter is
/// disabled; polling the same request sooner or later changes nothing.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    inner: backoff::ExponentialBackoff,
}

impl ExponentialBackoff {
    pub fn new(
        initial_interval: Duration,
        max_interval: Duration,
        multiplier: f64,
        max_elapsed: Duration,
    ) -> Self {
        let inner = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(initial_interval)
            .with_max_interval(max_interval)
            .with_multiplier(multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(Some(max_elapsed))
            .build();
        ExponentialBackoff { inner }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        // Total budget matches the default ingress expiry window: polling
        // past the request's expiry cannot succeed.
        ExponentialBackoff::new(
            Duration::from_millis(500),
            Duration::from_secs(10),
            1.4,
            Duration::from_secs(300),
        )
    }
}

impl PollStrategy for ExponentialBackoff {
    fn next_poll_delay(&mut self) -> Option<Duration> {
        self.inner.next_backoff()
    }
}
