//! Request cadence, identity rotation and block recovery.
//!
//! One [`PacingController`] is owned by each harvest job and never shared:
//! backoff accounting for one source must not slow down another. Its
//! [`PacingController::wait`] is the only place a job suspends before the
//! network, which keeps requests from one job strictly sequential.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:132.0) Gecko/20100101 Firefox/132.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_6) AppleWebKit/605.1.15 \
     (KHTML, like Gecko) Version/17.6 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
];

/// Pacing parameters for one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Lower bound of the randomized inter-request delay.
    pub min_delay_ms: u64,
    /// Upper bound of the randomized inter-request delay.
    pub max_delay_ms: u64,
    /// Multiplier growth per consecutive block.
    pub backoff_factor: f64,
    /// Cap on the delay multiplier.
    pub max_multiplier: f64,
    /// Consecutive blocks tolerated before giving up on a unit.
    pub max_retries: u32,
    /// User-agent pool. Empty means the built-in desktop browser pool.
    pub user_agents: Vec<String>,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1500,
            max_delay_ms: 4000,
            backoff_factor: 2.0,
            max_multiplier: 16.0,
            max_retries: 3,
            user_agents: Vec::new(),
        }
    }
}

impl PacingConfig {
    /// No delays; for tests and local fixtures.
    pub fn immediate() -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms: 0,
            ..Self::default()
        }
    }
}

/// Mutable per-job pacing state.
#[derive(Debug, Clone, PartialEq)]
pub struct PacingState {
    /// Delay applied before the most recent request.
    pub current_delay_ms: u64,
    pub consecutive_failures: u32,
    pub identity_index: usize,
    pub multiplier: f64,
    pub requests: u64,
}

/// Owns request cadence for a single job.
pub struct PacingController {
    config: PacingConfig,
    agents: Vec<String>,
    state: PacingState,
    rng: StdRng,
}

impl PacingController {
    pub fn new(config: PacingConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic jitter and identity choice.
    pub fn with_seed(config: PacingConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: PacingConfig, mut rng: StdRng) -> Self {
        let agents: Vec<String> = if config.user_agents.is_empty() {
            DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect()
        } else {
            config.user_agents.clone()
        };
        let identity_index = rng.gen_range(0..agents.len());
        Self {
            config,
            agents,
            state: PacingState {
                current_delay_ms: 0,
                consecutive_failures: 0,
                identity_index,
                multiplier: 1.0,
                requests: 0,
            },
            rng,
        }
    }

    /// Suspend for the current delay. Call before every network operation.
    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        self.state.current_delay_ms = delay.as_millis() as u64;
        self.state.requests += 1;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Draw the next delay from the configured band, scaled by backoff.
    pub fn next_delay(&mut self) -> Duration {
        let lo = self.config.min_delay_ms;
        let hi = self.config.max_delay_ms.max(lo);
        let base = if hi == 0 { 0 } else { self.rng.gen_range(lo..=hi) };
        Duration::from_millis((base as f64 * self.state.multiplier).round() as u64)
    }

    /// A request got through: drop the backoff entirely.
    pub fn record_success(&mut self) {
        if self.state.consecutive_failures > 0 {
            tracing::debug!(
                "pacing recovered after {} block(s)",
                self.state.consecutive_failures
            );
        }
        self.state.consecutive_failures = 0;
        self.state.multiplier = 1.0;
    }

    /// A request was blocked. Grows the backoff, rotates identity and
    /// returns whether another attempt is within the retry budget.
    pub fn record_block(&mut self, status_hint: Option<u16>) -> bool {
        self.state.consecutive_failures += 1;
        self.state.multiplier =
            (self.state.multiplier * self.config.backoff_factor).min(self.config.max_multiplier);
        self.rotate_identity();

        let retry = self.state.consecutive_failures <= self.config.max_retries;
        tracing::warn!(
            status = ?status_hint,
            failures = self.state.consecutive_failures,
            multiplier = self.state.multiplier,
            retry,
            "request blocked"
        );
        retry
    }

    /// Give the next unit a fresh retry budget. The backoff multiplier is
    /// kept so the source still sees a slowed cadence.
    pub fn reset_retry_budget(&mut self) {
        self.state.consecutive_failures = 0;
    }

    /// The user-agent to present on the next request.
    pub fn identity(&self) -> &str {
        &self.agents[self.state.identity_index]
    }

    fn rotate_identity(&mut self) {
        if self.agents.len() > 1 {
            let next = self.rng.gen_range(0..self.agents.len() - 1);
            // skip the current index so rotation always changes identity
            self.state.identity_index = if next >= self.state.identity_index {
                next + 1
            } else {
                next
            };
        }
    }

    pub fn state(&self) -> &PacingState {
        &self.state
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }
}
