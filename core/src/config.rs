use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::computable::StabilizeOptions;
use crate::poll::PollPoolOptions;
use crate::sync::ConcurrencyLimiter;
use computable_signals::{ChangeSource, KeyedChangeSource, DEFAULT_RECHECK_PERIOD};

/// Tunables of the engine, grouped so an embedding application can load them from its own
/// configuration file. Every field has a default, so a partial document is fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay between two evaluations of an unstable cell while stabilizing
    pub stabilize_backoff_ms: u64,
    /// Optional upper bound for stabilization, no bound when absent
    pub stabilize_timeout_ms: Option<u64>,
    /// Attach operations between two housekeeping sweeps of a change source
    pub recheck_period: usize,
    /// Minimal delay between two polling cycles
    pub poll_min_delay_ms: u64,
    /// Ceiling of concurrently running limited operations
    pub concurrency_limit: usize,
}

pub const DEFAULT_STABILIZE_BACKOFF: Duration = Duration::from_millis(10);
pub const DEFAULT_POLL_MIN_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 32;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stabilize_backoff_ms: DEFAULT_STABILIZE_BACKOFF.as_millis() as u64,
            stabilize_timeout_ms: None,
            recheck_period: DEFAULT_RECHECK_PERIOD,
            poll_min_delay_ms: DEFAULT_POLL_MIN_DELAY.as_millis() as u64,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> { serde_json::from_str(json) }

    pub fn stabilize_options(&self) -> StabilizeOptions {
        let options = StabilizeOptions::default().with_backoff(Duration::from_millis(self.stabilize_backoff_ms));
        match self.stabilize_timeout_ms {
            Some(ms) => options.with_timeout(Duration::from_millis(ms)),
            None => options,
        }
    }

    pub fn poll_pool_options(&self) -> PollPoolOptions { PollPoolOptions { min_delay: Duration::from_millis(self.poll_min_delay_ms) } }

    pub fn limiter(&self) -> ConcurrencyLimiter { ConcurrencyLimiter::new(self.concurrency_limit) }

    pub fn change_source(&self) -> ChangeSource { ChangeSource::with_recheck_period(self.recheck_period) }

    pub fn keyed_change_source<K: std::hash::Hash + Eq + Clone>(&self) -> KeyedChangeSource<K> {
        KeyedChangeSource::with_recheck_period(self.recheck_period)
    }
}
