//! Credential pool composition
//!
//! `PoolManager` owns the in-memory components and is the single object the
//! proxy layer talks to. It is constructed explicitly by the composition root
//! and its background sweeper is started and stopped explicitly.
//!
//! A credential is available when the rate limiter has it neither suspended
//! nor backing off AND no provider cooldown is active. Selection filters to
//! available candidates, then picks the highest health score.
//!
//! Error reporting dispatch:
//! - Transient → limiter backoff + failed request in the scorer; escalates to
//!   Suspended if the error text matches the suspension classifier
//! - Throttled → failed request + short exponential cooldown
//! - QuotaExhausted → failed request + quota 0 + cooldown until local midnight
//! - Suspended → limiter suspension + 24h cooldown
//!
//! Quota reports from the usage checker go through `apply_quota`: the
//! remaining fraction feeds the scorer, and an exhausted account cools down
//! until its reported reset (local midnight when none is given).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kiro_auth::QuotaStatus;
use reqwest::header::HeaderMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{ErrorClassification, classify_status_with};
use crate::cooldown::{
    CooldownReason, CooldownTracker, DEFAULT_SWEEP_INTERVAL, LONG_COOLDOWN, cooldown_for_429,
    cooldown_until_next_day,
};
use crate::fingerprint::{Fingerprint, FingerprintGenerator};
use crate::jitter::HumanLikeDelay;
use crate::rate_limiter::{Availability, RateLimiter, RateLimiterConfig};
use crate::scorer::{ScoringWeights, TokenScorer};

pub struct PoolManager {
    rate_limiter: Arc<RateLimiter>,
    cooldowns: Arc<CooldownTracker>,
    scorer: Arc<TokenScorer>,
    fingerprints: Arc<FingerprintGenerator>,
    pacing: HumanLikeDelay,
    sweep_interval: Duration,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PoolManager {
    pub fn new(rate_limiter: RateLimiter, scorer: TokenScorer, sweep_interval: Duration) -> Self {
        Self {
            rate_limiter: Arc::new(rate_limiter),
            cooldowns: Arc::new(CooldownTracker::new()),
            scorer: Arc::new(scorer),
            fingerprints: Arc::new(FingerprintGenerator::new()),
            pacing: HumanLikeDelay::new(),
            sweep_interval,
            sweeper: Mutex::new(None),
        }
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn cooldowns(&self) -> &Arc<CooldownTracker> {
        &self.cooldowns
    }

    pub fn scorer(&self) -> &Arc<TokenScorer> {
        &self.scorer
    }

    pub fn fingerprints(&self) -> &Arc<FingerprintGenerator> {
        &self.fingerprints
    }

    pub async fn is_available(&self, key: &str) -> bool {
        self.rate_limiter.is_available(key).await && !self.cooldowns.is_active(key).await
    }

    /// Healthiest available candidate, or `None` when every candidate is
    /// backing off, cooling down or suspended.
    pub async fn select<'a, S: AsRef<str>>(&self, candidates: &'a [S]) -> Option<&'a S> {
        let mut available = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if self.is_available(candidate.as_ref()).await {
                available.push(candidate);
            }
        }
        let best = self.scorer.select_best(&available).await.copied();
        if best.is_none() && !candidates.is_empty() {
            debug!(candidates = candidates.len(), "no credential available");
        }
        best
    }

    pub async fn record_success(&self, key: &str, latency: Duration) {
        self.rate_limiter.mark_success(key).await;
        self.scorer.record_request(key, true, latency).await;
    }

    /// Apply the pool reaction for a classified upstream failure.
    pub async fn report_error(
        &self,
        key: &str,
        classification: ErrorClassification,
        latency: Duration,
        error_text: &str,
    ) {
        let classification = match classification {
            ErrorClassification::Transient
                if self.rate_limiter.classifier().is_suspension(error_text) =>
            {
                ErrorClassification::Suspended
            }
            other => other,
        };
        debug!(
            account_id = key,
            classification = classification.label(),
            "upstream error reported"
        );

        match classification {
            ErrorClassification::Transient => {
                self.rate_limiter.mark_failed(key).await;
                self.scorer.record_request(key, false, latency).await;
            }
            ErrorClassification::Throttled => {
                self.scorer.record_request(key, false, latency).await;
                let retries = self
                    .scorer
                    .metrics(key)
                    .await
                    .map_or(0, |m| m.fail_count.saturating_sub(1));
                self.cooldowns
                    .set(key, cooldown_for_429(retries), CooldownReason::RateLimitExceeded)
                    .await;
            }
            ErrorClassification::QuotaExhausted => {
                self.scorer.record_request(key, false, latency).await;
                self.scorer.set_quota_remaining(key, 0.0).await;
                self.cooldowns
                    .set(key, cooldown_until_next_day(), CooldownReason::QuotaExhausted)
                    .await;
            }
            ErrorClassification::Suspended => {
                if !self
                    .rate_limiter
                    .check_and_mark_suspended(key, error_text)
                    .await
                {
                    self.rate_limiter.mark_suspended(key).await;
                }
                self.scorer.record_request(key, false, latency).await;
                self.cooldowns
                    .set(key, LONG_COOLDOWN, CooldownReason::AccountSuspended)
                    .await;
            }
        }
    }

    /// Apply a usage check result to the scorer and cooldowns.
    ///
    /// A replenished account loses a quota cooldown it was still serving;
    /// other cooldown reasons are left alone.
    pub async fn apply_quota(&self, key: &str, status: &QuotaStatus) {
        self.scorer
            .set_quota_remaining(key, status.remaining_fraction())
            .await;

        if status.is_exhausted {
            let until_reset = status
                .next_reset
                .and_then(|reset| (reset - Utc::now()).to_std().ok())
                .filter(|d| !d.is_zero());
            let duration = until_reset.unwrap_or_else(cooldown_until_next_day);
            self.cooldowns
                .set(key, duration, CooldownReason::QuotaExhausted)
                .await;
        } else if self.cooldowns.is_active(key).await
            && self.cooldowns.reason(key).await == Some(CooldownReason::QuotaExhausted)
        {
            self.cooldowns.clear(key).await;
            info!(account_id = key, "quota replenished, cooldown lifted");
        }
    }

    /// Human-like wait before the next upstream request. Streaming requests
    /// are never delayed.
    pub fn pacing_delay(&self, streaming: bool) -> Duration {
        if streaming {
            return Duration::ZERO;
        }
        self.pacing.next()
    }

    /// Classify with the limiter's suspension classifier.
    pub fn classify(&self, status: u16, body: &str) -> ErrorClassification {
        classify_status_with(status, body, &**self.rate_limiter.classifier())
    }

    pub async fn fingerprint(&self, key: &str) -> Arc<Fingerprint> {
        self.fingerprints.get(key).await
    }

    pub async fn apply_fingerprint(&self, key: &str, headers: &mut HeaderMap) {
        self.fingerprints.get(key).await.apply_headers(headers);
    }

    /// Clear limiter, cooldown and scoring state. The fingerprint is kept so
    /// the credential keeps its device identity.
    pub async fn reset(&self, key: &str) {
        self.rate_limiter.clear(key).await;
        self.cooldowns.clear(key).await;
        self.scorer.reset(key).await;
        info!(account_id = key, "credential state reset");
    }

    /// Drop every trace of a credential, fingerprint included.
    pub async fn forget(&self, key: &str) {
        self.reset(key).await;
        self.fingerprints.remove(key).await;
    }

    /// Pool health summary for the given credential ids.
    ///
    /// All available → healthy, some available → degraded, none (or no
    /// credentials at all) → unhealthy.
    pub async fn health<S: AsRef<str>>(&self, keys: &[S]) -> serde_json::Value {
        let mut accounts = Vec::with_capacity(keys.len());
        let mut available_count = 0usize;
        let mut cooling_count = 0usize;
        let mut suspended_count = 0usize;

        for key in keys {
            let key = key.as_ref();
            let availability = self.rate_limiter.availability(key).await;
            let fail_count = self
                .rate_limiter
                .state(key)
                .await
                .map_or(0, |s| s.fail_count);
            let cooldown_active = self.cooldowns.is_active(key).await;
            let score = self.scorer.score(key).await;

            let status = match availability {
                Availability::Suspended => {
                    suspended_count += 1;
                    "suspended"
                }
                Availability::Cooldown { .. } => {
                    cooling_count += 1;
                    "cooling_down"
                }
                Availability::Available if cooldown_active => {
                    cooling_count += 1;
                    "cooling_down"
                }
                Availability::Available => {
                    available_count += 1;
                    "available"
                }
            };

            let mut account = serde_json::json!({
                "id": key,
                "status": status,
                "fail_count": fail_count,
                "score": score,
            });
            if cooldown_active {
                account["cooldown_reason"] = self
                    .cooldowns
                    .reason(key)
                    .await
                    .map(|r| r.as_str())
                    .into();
                account["cooldown_remaining_secs"] =
                    self.cooldowns.remaining(key).await.as_secs().into();
            }
            accounts.push(account);
        }

        let total = keys.len();
        let pool_status = if available_count == total && total > 0 {
            "healthy"
        } else if available_count > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": pool_status,
            "accounts_total": total,
            "accounts_available": available_count,
            "accounts_cooling_down": cooling_count,
            "accounts_suspended": suspended_count,
            "accounts": accounts
        })
    }

    /// Start the cooldown sweeper under a child of `parent`. No-op if it is
    /// already running.
    pub async fn start(&self, parent: &CancellationToken) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return;
        }
        let cancel = parent.child_token();
        let handle = Arc::clone(&self.cooldowns).spawn_sweeper(self.sweep_interval, cancel.clone());
        *sweeper = Some((cancel, handle));
        info!(
            sweep_interval_secs = self.sweep_interval.as_secs(),
            "pool manager started"
        );
    }

    /// Stop the sweeper and wait for it. Idempotent.
    pub async fn stop(&self) {
        let Some((cancel, handle)) = self.sweeper.lock().await.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "cooldown sweeper ended abnormally");
        }
        info!("pool manager stopped");
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new(
            RateLimiter::new(RateLimiterConfig::default()),
            TokenScorer::new(ScoringWeights::default()),
            DEFAULT_SWEEP_INTERVAL,
        )
    }
}
