//! Provider-imposed cooldowns
//!
//! A cooldown is a suppression window the caller sets after the upstream
//! explicitly throttles or suspends a credential. It is independent of the
//! rate limiter's own backoff. Expired entries stay in the map, inert, until
//! the sweeper removes them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Days, Local, TimeZone};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_SHORT_COOLDOWN: Duration = Duration::from_secs(60);
pub const MAX_SHORT_COOLDOWN: Duration = Duration::from_secs(5 * 60);
pub const LONG_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Deadline used when `now + duration` does not fit an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// `now + duration`, saturating to a far-future deadline instead of
/// overflowing.
pub(crate) fn deadline_after(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration)
        .or_else(|| now.checked_add(FAR_FUTURE.min(duration)))
        .unwrap_or(now)
}

/// Why a credential is cooling down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CooldownReason {
    RateLimitExceeded,
    AccountSuspended,
    QuotaExhausted,
}

impl CooldownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CooldownReason::RateLimitExceeded => "rate_limit_exceeded",
            CooldownReason::AccountSuspended => "account_suspended",
            CooldownReason::QuotaExhausted => "quota_exhausted",
        }
    }
}

impl fmt::Display for CooldownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct CooldownEntry {
    until: Instant,
    reason: CooldownReason,
}

/// Per-credential cooldown windows.
#[derive(Default)]
pub struct CooldownTracker {
    entries: RwLock<HashMap<String, CooldownEntry>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or replace) a cooldown for `key`.
    pub async fn set(&self, key: &str, duration: Duration, reason: CooldownReason) {
        let until = deadline_after(Instant::now(), duration);
        self.entries
            .write()
            .await
            .insert(key.to_string(), CooldownEntry { until, reason });
        metrics::counter!("kiro_pool_cooldowns_total", "reason" => reason.as_str()).increment(1);
        info!(
            account_id = key,
            reason = reason.as_str(),
            cooldown_secs = duration.as_secs(),
            "credential entering cooldown"
        );
    }

    pub async fn is_active(&self, key: &str) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .is_some_and(|entry| Instant::now() < entry.until)
    }

    /// Time left in the cooldown; zero when inactive or absent.
    pub async fn remaining(&self, key: &str) -> Duration {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .map(|entry| entry.until.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    /// Reason of the most recent cooldown, even if it has expired but not
    /// yet been swept.
    pub async fn reason(&self, key: &str) -> Option<CooldownReason> {
        self.entries.read().await.get(key).map(|entry| entry.reason)
    }

    pub async fn clear(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    /// Drop every entry whose end time has passed. Returns how many were
    /// removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.until > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Sweep expired entries every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately; nothing to sweep yet
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("cooldown sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let removed = self.sweep_expired().await;
                        if removed > 0 {
                            debug!(removed, "swept expired cooldowns");
                        }
                    }
                }
            }
        })
    }
}

/// Exponential cooldown for a 429: `1min * 2^retry`, capped at 5 minutes.
pub fn cooldown_for_429(retry_count: u32) -> Duration {
    1u32.checked_shl(retry_count)
        .and_then(|factor| DEFAULT_SHORT_COOLDOWN.checked_mul(factor))
        .map_or(MAX_SHORT_COOLDOWN, |d| d.min(MAX_SHORT_COOLDOWN))
}

/// Time left until the next local midnight, for daily quota exhaustion.
pub fn cooldown_until_next_day() -> Duration {
    duration_until_next_midnight(&Local::now())
}

fn duration_until_next_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> Duration {
    now.date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| midnight.and_local_timezone(now.timezone()).earliest())
        .and_then(|midnight| (midnight - now.clone()).to_std().ok())
        .unwrap_or(LONG_COOLDOWN)
}
