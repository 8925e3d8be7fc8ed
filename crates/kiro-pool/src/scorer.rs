//! Health-weighted credential selection
//!
//! Tracks per-credential request outcomes reported by the proxy layer and
//! folds them into one score:
//!
//! ```text
//! score = w_success * success_rate
//!       + w_quota   * quota_remaining
//!       + w_latency * exp(-avg_latency_ms / 1000)
//!       + w_recency * (1 - exp(-secs_since_last_use / 60))
//! score *= max(0, 1 - penalty * consecutive_failures)
//! ```
//!
//! Unknown credentials score 1.0 so fresh accounts get tried early.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Rolling metrics for one credential. Values handed out are copies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenMetrics {
    /// successes / total, 1.0 before any request
    pub success_rate: f64,
    /// Cumulative average latency in milliseconds
    pub avg_latency_ms: f64,
    /// Remaining quota fraction, 0.0 to 1.0
    pub quota_remaining: f64,
    pub last_used: Option<Instant>,
    /// Consecutive failures, reset on success
    pub fail_count: u32,
    pub total_requests: u64,
    success_count: u64,
    total_latency_ms: f64,
}

impl Default for TokenMetrics {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            avg_latency_ms: 0.0,
            quota_remaining: 1.0,
            last_used: None,
            fail_count: 0,
            total_requests: 0,
            success_count: 0,
            total_latency_ms: 0.0,
        }
    }
}

/// Weights for the score components. The four component weights should sum
/// to 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    pub success_rate: f64,
    pub quota: f64,
    pub latency: f64,
    pub recency: f64,
    /// Score reduction per consecutive failure
    pub fail_penalty: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            success_rate: 0.40,
            quota: 0.25,
            latency: 0.20,
            recency: 0.15,
            fail_penalty: 0.1,
        }
    }
}

pub struct TokenScorer {
    metrics: RwLock<HashMap<String, TokenMetrics>>,
    weights: ScoringWeights,
}

impl TokenScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            weights,
        }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Record the outcome of one request.
    pub async fn record_request(&self, key: &str, success: bool, latency: Duration) {
        let mut metrics = self.metrics.write().await;
        let m = metrics.entry(key.to_string()).or_default();
        m.total_requests += 1;
        m.last_used = Some(Instant::now());
        m.total_latency_ms += latency.as_secs_f64() * 1000.0;
        if success {
            m.success_count += 1;
            m.fail_count = 0;
        } else {
            m.fail_count = m.fail_count.saturating_add(1);
        }
        m.success_rate = m.success_count as f64 / m.total_requests as f64;
        m.avg_latency_ms = m.total_latency_ms / m.total_requests as f64;
    }

    /// Update the quota signal, clamped to `0.0..=1.0`.
    pub async fn set_quota_remaining(&self, key: &str, fraction: f64) {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        let mut metrics = self.metrics.write().await;
        metrics.entry(key.to_string()).or_default().quota_remaining = fraction;
    }

    pub async fn metrics(&self, key: &str) -> Option<TokenMetrics> {
        self.metrics.read().await.get(key).copied()
    }

    pub async fn score(&self, key: &str) -> f64 {
        let metrics = self.metrics.read().await;
        self.score_of(metrics.get(key), Instant::now())
    }

    /// Highest-scoring key. Ties go to the earliest key; a single candidate
    /// is returned without scoring.
    pub async fn select_best<'a, S: AsRef<str>>(&self, keys: &'a [S]) -> Option<&'a S> {
        match keys {
            [] => None,
            [only] => Some(only),
            [first, rest @ ..] => {
                let metrics = self.metrics.read().await;
                let now = Instant::now();
                let mut best = first;
                let mut best_score = self.score_of(metrics.get(first.as_ref()), now);
                for key in rest {
                    let score = self.score_of(metrics.get(key.as_ref()), now);
                    if score > best_score {
                        best = key;
                        best_score = score;
                    }
                }
                Some(best)
            }
        }
    }

    pub async fn reset(&self, key: &str) {
        self.metrics.write().await.remove(key);
    }

    pub async fn reset_all(&self) {
        self.metrics.write().await.clear();
    }

    fn score_of(&self, metrics: Option<&TokenMetrics>, now: Instant) -> f64 {
        let Some(m) = metrics else {
            return 1.0;
        };
        let w = &self.weights;

        let latency = if m.total_requests == 0 {
            1.0
        } else {
            (-m.avg_latency_ms / 1000.0).exp()
        };
        let recency = match m.last_used {
            Some(last) => 1.0 - (-now.saturating_duration_since(last).as_secs_f64() / 60.0).exp(),
            None => 1.0,
        };

        let score = w.success_rate * m.success_rate
            + w.quota * m.quota_remaining
            + w.latency * latency
            + w.recency * recency;

        if m.fail_count > 0 {
            score * (1.0 - w.fail_penalty * f64::from(m.fail_count)).max(0.0)
        } else {
            score
        }
    }
}

impl Default for TokenScorer {
    fn default() -> Self {
        Self::new(ScoringWeights::default())
    }
}
