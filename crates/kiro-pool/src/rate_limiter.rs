//! Per-credential failure backoff and suspension
//!
//! Each credential key moves through three states independently:
//! - Available → Cooldown on `mark_failed` (exponential backoff)
//! - Cooldown → Available when the backoff expires or on `mark_success`
//! - any → Suspended when an error message matches the suspension classifier
//! - Suspended → Available only through `reset_suspension` or `clear`
//!
//! State is created lazily on the first failure or suspension; a success on
//! an unknown key records nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::classify::{PhraseClassifier, SuspensionClassifier};
use crate::cooldown::deadline_after;
use crate::jitter::{DEFAULT_JITTER_PERCENT, jitter_delay, random_delay};

pub const DEFAULT_MIN_TOKEN_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_TOKEN_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_DAILY_MAX_REQUESTS: u32 = 500;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(60);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_SUSPEND_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// Tunables for the rate limiter. Override individual fields with
/// struct-update syntax over `Default::default()`.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Lower bound of the per-credential pacing interval
    pub min_token_interval: Duration,
    /// Upper bound of the per-credential pacing interval
    pub max_token_interval: Duration,
    /// Advisory daily request cap, enforced by the caller
    pub daily_max_requests: u32,
    /// Fractional jitter applied to backoff and pacing; 0 or less disables
    /// it, values above 1.0 fall back to the default
    pub jitter_percent: f64,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: f64,
    /// How long a detected suspension keeps the cooldown end in the future
    pub suspend_cooldown: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_token_interval: DEFAULT_MIN_TOKEN_INTERVAL,
            max_token_interval: DEFAULT_MAX_TOKEN_INTERVAL,
            daily_max_requests: DEFAULT_DAILY_MAX_REQUESTS,
            jitter_percent: DEFAULT_JITTER_PERCENT,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            suspend_cooldown: DEFAULT_SUSPEND_COOLDOWN,
        }
    }
}

/// Snapshot of one credential's limiter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenState {
    pub fail_count: u32,
    pub cooldown_end: Option<Instant>,
    pub suspended: bool,
    pub last_failure: Option<Instant>,
}

impl TokenState {
    fn availability(&self, now: Instant) -> Availability {
        if self.suspended {
            return Availability::Suspended;
        }
        match self.cooldown_end {
            Some(until) if until > now => Availability::Cooldown { until },
            _ => Availability::Available,
        }
    }
}

/// Derived state of a credential, for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    Cooldown { until: Instant },
    Suspended,
}

impl Availability {
    pub fn label(&self) -> &'static str {
        match self {
            Availability::Available => "available",
            Availability::Cooldown { .. } => "cooldown",
            Availability::Suspended => "suspended",
        }
    }
}

/// Per-credential failure and suspension tracking.
pub struct RateLimiter {
    states: RwLock<HashMap<String, TokenState>>,
    config: RateLimiterConfig,
    classifier: Arc<dyn SuspensionClassifier>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            config,
            classifier: Arc::new(PhraseClassifier::default()),
        }
    }

    /// Replace the suspension classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn SuspensionClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn classifier(&self) -> &Arc<dyn SuspensionClassifier> {
        &self.classifier
    }

    /// Unknown keys are available.
    pub async fn is_available(&self, key: &str) -> bool {
        self.availability(key).await == Availability::Available
    }

    pub async fn availability(&self, key: &str) -> Availability {
        let states = self.states.read().await;
        match states.get(key) {
            Some(state) => state.availability(Instant::now()),
            None => Availability::Available,
        }
    }

    /// Record a failure and push the cooldown end out by the backoff for the
    /// new failure count. Returns the backoff applied.
    pub async fn mark_failed(&self, key: &str) -> Duration {
        let now = Instant::now();
        let mut states = self.states.write().await;
        let state = states.entry(key.to_string()).or_default();
        state.fail_count = state.fail_count.saturating_add(1);
        state.last_failure = Some(now);

        let backoff = self.backoff(state.fail_count);
        let candidate = deadline_after(now, backoff);
        // Jitter must not pull an existing cooldown end backwards
        state.cooldown_end = Some(match state.cooldown_end {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        });

        metrics::counter!("kiro_pool_failures_total").increment(1);
        debug!(
            account_id = key,
            fail_count = state.fail_count,
            backoff_secs = backoff.as_secs(),
            "credential marked failed"
        );
        backoff
    }

    /// Reset the failure count and cooldown. Suspension is left alone.
    pub async fn mark_success(&self, key: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(key) {
            state.fail_count = 0;
            state.cooldown_end = None;
        }
    }

    /// Suspend the credential when `error_text` matches the classifier.
    ///
    /// Returns whether the credential was suspended; on no match the state is
    /// untouched.
    pub async fn check_and_mark_suspended(&self, key: &str, error_text: &str) -> bool {
        if !self.classifier.is_suspension(error_text) {
            return false;
        }
        self.suspend(key).await;
        warn!(account_id = key, error = error_text, "credential suspended");
        true
    }

    /// Suspend unconditionally, for callers that classified the error
    /// themselves.
    pub async fn mark_suspended(&self, key: &str) {
        self.suspend(key).await;
        warn!(account_id = key, "credential suspended");
    }

    async fn suspend(&self, key: &str) {
        let now = Instant::now();
        let mut states = self.states.write().await;
        let state = states.entry(key.to_string()).or_default();
        state.suspended = true;
        state.cooldown_end = Some(deadline_after(now, self.config.suspend_cooldown));
        state.last_failure = Some(now);
        metrics::counter!("kiro_pool_suspensions_total").increment(1);
    }

    /// Lift a suspension and its cooldown. No-op for unknown keys.
    pub async fn reset_suspension(&self, key: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(key) {
            state.suspended = false;
            state.fail_count = 0;
            state.cooldown_end = None;
            info!(account_id = key, "suspension reset");
        }
    }

    /// Forget everything about a key.
    pub async fn clear(&self, key: &str) {
        self.states.write().await.remove(key);
    }

    /// Copy of the key's state, or `None` if nothing was ever recorded.
    pub async fn state(&self, key: &str) -> Option<TokenState> {
        self.states.read().await.get(key).copied()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }

    pub fn daily_max_requests(&self) -> u32 {
        self.config.daily_max_requests
    }

    /// `min(base * multiplier^(n-1), max)` with jitter, never above `max`.
    /// Zero failures means no backoff.
    pub fn backoff(&self, fail_count: u32) -> Duration {
        if fail_count == 0 {
            return Duration::ZERO;
        }
        let max = self.config.backoff_max;
        let multiplier = self.config.backoff_multiplier.max(1.0);
        let exponent = i32::try_from(fail_count - 1).unwrap_or(i32::MAX);
        let secs = self.config.backoff_base.as_secs_f64() * multiplier.powi(exponent);
        let raw = if secs.is_finite() && secs < max.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            max
        };
        self.jittered(raw).min(max)
    }

    /// Randomized pacing delay between two uses of the same credential.
    pub fn next_interval(&self) -> Duration {
        self.jittered(random_delay(
            self.config.min_token_interval,
            self.config.max_token_interval,
        ))
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.config.jitter_percent > 0.0 {
            jitter_delay(base, self.config.jitter_percent)
        } else {
            base
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_named_constants() {
        let limiter = RateLimiter::default();
        let cfg = limiter.config();
        assert_eq!(cfg.min_token_interval, DEFAULT_MIN_TOKEN_INTERVAL);
        assert_eq!(cfg.max_token_interval, DEFAULT_MAX_TOKEN_INTERVAL);
        assert_eq!(limiter.daily_max_requests(), DEFAULT_DAILY_MAX_REQUESTS);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            min_token_interval: Duration::from_secs(5),
            ..Default::default()
        });
        assert_eq!(limiter.config().min_token_interval, Duration::from_secs(5));
        assert_eq!(limiter.config().max_token_interval, DEFAULT_MAX_TOKEN_INTERVAL);
    }

    #[tokio::test]
    async fn unknown_key_is_available_and_stateless() {
        let limiter = RateLimiter::default();
        assert!(limiter.is_available("new").await);
        assert!(limiter.state("new").await.is_none());
    }

    #[tokio::test]
    async fn success_on_unknown_key_creates_no_state() {
        let limiter = RateLimiter::default();
        limiter.mark_success("tok").await;
        assert!(limiter.is_empty().await);
    }

    #[tokio::test]
    async fn mark_failed_sets_cooldown() {
        let limiter = RateLimiter::default();
        limiter.mark_failed("tok").await;

        let state = limiter.state("tok").await.unwrap();
        assert_eq!(state.fail_count, 1);
        assert!(state.cooldown_end.is_some());
        assert!(!limiter.is_available("tok").await);
        assert!(matches!(
            limiter.availability("tok").await,
            Availability::Cooldown { .. }
        ));
    }

    #[tokio::test]
    async fn repeated_failures_never_pull_cooldown_back() {
        let limiter = RateLimiter::default();
        let mut previous = None;
        for n in 1..=8 {
            limiter.mark_failed("tok").await;
            let state = limiter.state("tok").await.unwrap();
            assert_eq!(state.fail_count, n);
            if let Some(prev) = previous {
                assert!(state.cooldown_end.unwrap() >= prev);
            }
            previous = state.cooldown_end;
        }
    }

    #[tokio::test]
    async fn success_resets_failures_and_cooldown() {
        let limiter = RateLimiter::default();
        limiter.mark_failed("tok").await;
        limiter.mark_failed("tok").await;
        limiter.mark_success("tok").await;

        let state = limiter.state("tok").await.unwrap();
        assert_eq!(state.fail_count, 0);
        assert!(state.cooldown_end.is_none());
        assert!(limiter.is_available("tok").await);
    }

    #[tokio::test]
    async fn suspension_phrase_suspends() {
        let limiter = RateLimiter::default();
        assert!(
            limiter
                .check_and_mark_suspended("tok", "Account has been suspended")
                .await
        );
        let state = limiter.state("tok").await.unwrap();
        assert!(state.suspended);
        assert!(!limiter.is_available("tok").await);
        assert_eq!(limiter.availability("tok").await, Availability::Suspended);
    }

    #[tokio::test]
    async fn ordinary_error_leaves_state_unchanged() {
        let limiter = RateLimiter::default();
        assert!(
            !limiter
                .check_and_mark_suspended("tok", "connection timeout")
                .await
        );
        assert!(limiter.state("tok").await.is_none());
        assert!(limiter.is_available("tok").await);
    }

    #[tokio::test]
    async fn success_does_not_lift_suspension() {
        let limiter = RateLimiter::default();
        limiter.mark_suspended("tok").await;
        limiter.mark_success("tok").await;
        assert!(!limiter.is_available("tok").await);
    }

    #[tokio::test]
    async fn reset_suspension_restores_availability() {
        let limiter = RateLimiter::default();
        limiter.check_and_mark_suspended("tok", "Account suspended").await;
        limiter.reset_suspension("tok").await;

        let state = limiter.state("tok").await.unwrap();
        assert!(!state.suspended);
        assert_eq!(state.fail_count, 0);
        assert!(state.cooldown_end.is_none());
        assert!(limiter.is_available("tok").await);
    }

    #[tokio::test]
    async fn reset_suspension_on_unknown_key_is_noop() {
        let limiter = RateLimiter::default();
        limiter.reset_suspension("missing").await;
        assert!(limiter.is_empty().await);
    }

    #[tokio::test]
    async fn clear_removes_state() {
        let limiter = RateLimiter::default();
        limiter.mark_failed("tok").await;
        limiter.clear("tok").await;
        assert!(limiter.state("tok").await.is_none());
    }

    #[tokio::test]
    async fn state_is_a_copy() {
        let limiter = RateLimiter::default();
        limiter.mark_failed("tok").await;
        let mut copy = limiter.state("tok").await.unwrap();
        copy.fail_count = 999;
        assert_eq!(limiter.state("tok").await.unwrap().fail_count, 1);
    }

    #[tokio::test]
    async fn injected_classifier_replaces_phrases() {
        let limiter = RateLimiter::default()
            .with_classifier(Arc::new(|text: &str| text.contains("ACCOUNT_BLOCKED")));
        assert!(!limiter.check_and_mark_suspended("a", "account suspended").await);
        assert!(limiter.check_and_mark_suspended("b", "code=ACCOUNT_BLOCKED").await);
    }

    #[test]
    fn backoff_zero_failures() {
        assert_eq!(RateLimiter::default().backoff(0), Duration::ZERO);
    }

    #[test]
    fn backoff_grows_exponentially_within_jitter() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(3600),
            backoff_multiplier: 2.0,
            jitter_percent: 0.3,
            ..Default::default()
        });
        for _ in 0..50 {
            let first = limiter.backoff(1);
            assert!(first >= Duration::from_secs(40) && first <= Duration::from_secs(80));
            let second = limiter.backoff(2);
            assert!(second >= Duration::from_secs(80) && second <= Duration::from_secs(160));
        }
    }

    #[test]
    fn backoff_without_jitter_is_monotonic_and_capped() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(600),
            backoff_multiplier: 2.0,
            jitter_percent: 0.0,
            ..Default::default()
        });
        let mut previous = Duration::ZERO;
        for n in 1..=64 {
            let backoff = limiter.backoff(n);
            assert!(backoff >= previous, "backoff({n}) decreased");
            assert!(backoff <= Duration::from_secs(600));
            previous = backoff;
        }
        assert_eq!(limiter.backoff(10), Duration::from_secs(600));
    }

    #[test]
    fn backoff_with_jitter_never_exceeds_max() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            backoff_max: Duration::from_secs(600),
            ..Default::default()
        });
        for _ in 0..100 {
            assert!(limiter.backoff(20) <= Duration::from_secs(600));
        }
    }

    #[test]
    fn next_interval_within_jittered_range() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            min_token_interval: Duration::from_secs(10),
            max_token_interval: Duration::from_secs(30),
            jitter_percent: 0.3,
            ..Default::default()
        });
        for _ in 0..100 {
            let interval = limiter.next_interval();
            assert!(interval >= Duration::from_secs(7), "{interval:?}");
            assert!(interval <= Duration::from_secs(40), "{interval:?}");
        }
    }

    #[tokio::test]
    async fn oversized_suspend_cooldown_does_not_overflow() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            suspend_cooldown: Duration::MAX,
            ..Default::default()
        });
        limiter.mark_suspended("tok").await;
        let state = limiter.state("tok").await.unwrap();
        assert!(state.suspended);
        assert!(state.cooldown_end.unwrap() > Instant::now());
    }

    #[tokio::test]
    async fn oversized_backoff_does_not_overflow() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            backoff_base: Duration::MAX,
            backoff_max: Duration::MAX,
            ..Default::default()
        });
        for _ in 0..3 {
            limiter.mark_failed("tok").await;
        }
        assert!(!limiter.is_available("tok").await);
        assert_eq!(limiter.state("tok").await.unwrap().fail_count, 3);
    }

    #[test]
    fn out_of_range_jitter_percent_uses_default_spread() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            backoff_base: Duration::from_secs(100),
            backoff_max: Duration::from_secs(1000),
            jitter_percent: 5.0,
            ..Default::default()
        });
        for _ in 0..100 {
            let first = limiter.backoff(1);
            assert!(first >= Duration::from_secs(70) && first <= Duration::from_secs(130));
        }
    }

    #[tokio::test]
    async fn concurrent_mixed_operations() {
        let limiter = Arc::new(RateLimiter::default());
        let mut handles = Vec::new();
        for task in 0..50u32 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("token{}", task % 10);
                for op in 0..50u32 {
                    match op % 6 {
                        0 => {
                            limiter.is_available(&key).await;
                        }
                        1 => {
                            limiter.mark_failed(&key).await;
                        }
                        2 => limiter.mark_success(&key).await,
                        3 => {
                            limiter.state(&key).await;
                        }
                        4 => {
                            limiter.check_and_mark_suspended(&key, "test error").await;
                        }
                        _ => limiter.reset_suspension(&key).await,
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(limiter.len().await <= 10);
    }
}
