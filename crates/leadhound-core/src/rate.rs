//! Adaptive inter-request delay.
//!
//! The delay starts at a mode-specific value, gets uniform jitter on every
//! use, decays toward the floor after a run of successes and backs off toward
//! the ceiling on connectivity errors. Every produced delay lies within
//! `[floor, ceiling]`.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use leadhound_core::rate::{RateConfig, RateController};
//!
//! let rate = RateController::new(
//!     RateConfig::direct().with_jitter(Duration::from_millis(250)),
//! );
//! let wait = rate.next_delay();
//! assert!(wait >= rate.config().floor && wait <= rate.config().ceiling);
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;

/// Configuration for the adaptive delay.
#[derive(Debug, Clone)]
pub struct RateConfig {
    /// Delay before any feedback has been recorded.
    pub start: Duration,
    /// Lowest delay ever produced.
    pub floor: Duration,
    /// Highest delay ever produced.
    pub ceiling: Duration,
    /// Maximum random jitter added per use (uniform [0, jitter]).
    pub jitter: Duration,
    /// Consecutive successes needed before the delay decays.
    pub success_run: u32,
    /// Multiplier applied on decay (< 1.0).
    pub decay_factor: f64,
    /// Multiplier applied on a connectivity error (> 1.0).
    pub backoff_factor: f64,
}

impl RateConfig {
    /// Preset for direct (no relay) mode: the job's own address is exposed,
    /// so it starts slow.
    pub fn direct() -> Self {
        Self {
            start: Duration::from_secs(3),
            floor: Duration::from_millis(1500),
            ceiling: Duration::from_secs(20),
            jitter: Duration::from_millis(1500),
            success_run: 5,
            decay_factor: 0.85,
            backoff_factor: 2.0,
        }
    }

    /// Preset for relayed mode.
    pub fn relayed() -> Self {
        Self {
            start: Duration::from_millis(1000),
            floor: Duration::from_millis(500),
            ceiling: Duration::from_secs(10),
            jitter: Duration::from_millis(750),
            success_run: 5,
            decay_factor: 0.85,
            backoff_factor: 1.5,
        }
    }

    /// Zero-delay config, mostly useful in tests.
    pub fn none() -> Self {
        Self {
            start: Duration::ZERO,
            floor: Duration::ZERO,
            ceiling: Duration::ZERO,
            jitter: Duration::ZERO,
            success_run: 1,
            decay_factor: 1.0,
            backoff_factor: 1.0,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_bounds(mut self, floor: Duration, ceiling: Duration) -> Self {
        self.floor = floor;
        self.ceiling = ceiling.max(floor);
        self
    }

    fn clamp(&self, d: Duration) -> Duration {
        d.clamp(self.floor, self.ceiling.max(self.floor))
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self::direct()
    }
}

#[derive(Debug)]
struct RateState {
    config: RateConfig,
    current: Duration,
    success_streak: u32,
}

/// Thread-safe adaptive delay shared by the lanes of one job.
#[derive(Debug, Clone)]
pub struct RateController {
    state: Arc<Mutex<RateState>>,
}

impl RateController {
    pub fn new(config: RateConfig) -> Self {
        let current = config.clamp(config.start);
        Self {
            state: Arc::new(Mutex::new(RateState {
                config,
                current,
                success_streak: 0,
            })),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> RateConfig {
        self.lock_state().config.clone()
    }

    /// Switch to another preset, e.g. when a job leaves its relay. The delay
    /// restarts from the new preset's start value.
    pub fn reconfigure(&self, config: RateConfig) {
        let mut state = self.lock_state();
        state.current = config.clamp(config.start);
        state.success_streak = 0;
        state.config = config;
        tracing::debug!(delay_ms = %state.current.as_millis(), "Delay preset switched");
    }

    fn lock_state(&self) -> MutexGuard<'_, RateState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Rate controller recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Current base delay without jitter.
    pub fn current(&self) -> Duration {
        self.lock_state().current
    }

    /// Delay to wait before the next request: base plus jitter, clamped.
    pub fn next_delay(&self) -> Duration {
        let state = self.lock_state();
        let jitter_ms = rand_jitter_ms(state.config.jitter.as_millis() as u64);
        state
            .config
            .clamp(state.current + Duration::from_millis(jitter_ms))
    }

    /// Record a successful request. A full run of successes decays the delay.
    pub fn record_success(&self) {
        let mut state = self.lock_state();
        state.success_streak += 1;
        if state.success_streak >= state.config.success_run {
            state.success_streak = 0;
            let decayed = state.current.mul_f64(state.config.decay_factor);
            state.current = state.config.clamp(decayed);
            tracing::debug!(delay_ms = %state.current.as_millis(), "Delay decayed");
        }
    }

    /// Record a connectivity error: reset the streak and back off.
    pub fn record_error(&self) {
        let mut state = self.lock_state();
        state.success_streak = 0;
        // Floor of 100ms so a zero delay can still grow.
        let base = state.current.max(Duration::from_millis(100));
        state.current = state.config.clamp(base.mul_f64(state.config.backoff_factor));
        tracing::debug!(delay_ms = %state.current.as_millis(), "Delay backed off");
    }
}

fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    rand::rng().random_range(0..=max_ms)
}
