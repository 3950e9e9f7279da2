//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration for provider and tool calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Cap on the escalating delay
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl RetryConfig {
    /// Backoff delay for a zero-based attempt number, capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let delay = self.initial_backoff.mul_f64(factor as f64);
        delay.min(self.max_backoff)
    }
}

/// Bounds for per-turn context composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposerConfig {
    /// How many most-recent entries the prompt-source scan inspects before
    /// falling back to the full-log broadcast lookup.
    pub scan_window: usize,
    /// Upper bound on the fallback lookup. The fallback exists so a
    /// long-running agent's mission directive is not evicted by scroll; the
    /// bound keeps composition latency predictable on huge logs.
    pub fallback_scan_limit: usize,
    /// Consecutive synthetic nudges before the agent is forced idle.
    pub nudge_limit: u32,
}

/// Master configuration struct.
/// ALL values are required - no defaults anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    // Population (REQUIRED)
    pub max_agents: usize,

    // Context composition (REQUIRED)
    pub composer: ComposerConfig,

    // Turn loop (REQUIRED)
    pub max_tool_iterations: u32,
    pub provider_retry: RetryConfig,
    pub tool_retry: RetryConfig,

    // Event bus (REQUIRED)
    pub bus_queue_capacity: usize,

    // Lifecycle timing (REQUIRED)
    /// Bound on how long Stop waits for an in-flight turn after canceling
    pub stop_wait_timeout: Duration,
    /// Bound on how long process shutdown waits for each agent worker
    pub shutdown_wait_timeout: Duration,
}

impl SwarmConfig {
    /// Build a default swarm configuration.
    ///
    /// This centralizes the "sane defaults" so embedders do not hardcode
    /// policy at call sites.
    pub fn default_swarm(max_agents: usize) -> Self {
        Self {
            max_agents,
            composer: ComposerConfig {
                scan_window: 50,
                fallback_scan_limit: 2000,
                nudge_limit: 3,
            },
            max_tool_iterations: 8,
            provider_retry: RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(500),
                max_backoff: Duration::from_secs(15),
                backoff_multiplier: 2.0,
            },
            tool_retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(250),
                max_backoff: Duration::from_secs(5),
                backoff_multiplier: 2.0,
            },
            bus_queue_capacity: 256,
            stop_wait_timeout: Duration::from_secs(5),
            shutdown_wait_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
