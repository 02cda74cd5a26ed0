//! Relay quality scoring.
//!
//! Combines provider-reported uptime and latency into one score where higher
//! is better. Fallback (paid) sources are capped below the free floor so the
//! pool only reaches them after every free candidate has failed.

use serde::{Deserialize, Serialize};

/// Weight for uptime in the composite score.
const UPTIME_WEIGHT: f64 = 0.7;

/// Weight for latency in the composite score.
const LATENCY_WEIGHT: f64 = 0.3;

/// Latency at or above which the latency component contributes nothing.
const LATENCY_CAP_MS: f64 = 5_000.0;

/// Minimum score for free candidates.
const FREE_SCORE_FLOOR: f64 = 10.0;

/// Maximum score for fallback candidates. Must stay below `FREE_SCORE_FLOOR`.
const FALLBACK_SCORE_CEILING: f64 = 5.0;

/// Which kind of source reported a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTier {
    #[default]
    Free,
    Fallback,
}

/// Compute the score for a candidate.
///
/// `uptime` is a percentage (0-100). The raw score is
/// `uptime * 0.7 + latency_component * 0.3`, where the latency component maps
/// 0 ms to 100 and `LATENCY_CAP_MS` or more to 0.
pub fn compute_score(uptime: f64, latency_ms: u64, tier: SourceTier) -> f64 {
    let uptime = if uptime.is_finite() {
        uptime.clamp(0.0, 100.0)
    } else {
        0.0
    };
    let latency = (latency_ms as f64).min(LATENCY_CAP_MS);
    let latency_component = 100.0 * (1.0 - latency / LATENCY_CAP_MS);

    let raw = uptime * UPTIME_WEIGHT + latency_component * LATENCY_WEIGHT;

    match tier {
        SourceTier::Free => raw.max(FREE_SCORE_FLOOR),
        SourceTier::Fallback => (raw / 100.0 * FALLBACK_SCORE_CEILING).min(FALLBACK_SCORE_CEILING),
    }
}
