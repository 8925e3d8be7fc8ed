//! Periodic usage quota monitoring
//!
//! On every tick the monitor checks each credential's remaining quota
//! through the `UsageClient` and hands the result to
//! `PoolManager::apply_quota`. Checks run one at a time so a large pool does
//! not burst the usage endpoint.
//!
//! A failed check is retried on a later tick after an exponential, jittered
//! delay per credential. Suspended credentials and credentials without an
//! access token are skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiro_auth::{Credential, UsageClient};
use reqwest::header::HeaderMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cooldown::deadline_after;
use crate::error::{Error, Result};
use crate::jitter::exponential_backoff_with_jitter;
use crate::pool::PoolManager;
use crate::rate_limiter::Availability;
use crate::repository::FileRepository;

pub const DEFAULT_QUOTA_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_QUOTA_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct QuotaMonitorConfig {
    pub interval: Duration,
    /// Per-check deadline
    pub timeout: Duration,
    /// First retry delay after a failed check; doubles per failure
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for QuotaMonitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_QUOTA_INTERVAL,
            timeout: DEFAULT_QUOTA_TIMEOUT,
            retry_base: DEFAULT_RETRY_BASE,
            retry_max: DEFAULT_RETRY_MAX,
        }
    }
}

/// Outcome counts for one monitoring cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaSummary {
    pub checked: usize,
    pub exhausted: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    failures: u32,
    not_before: Instant,
}

pub struct QuotaMonitor {
    repository: Arc<FileRepository>,
    pool: Arc<PoolManager>,
    client: Arc<dyn UsageClient>,
    config: QuotaMonitorConfig,
    retries: Mutex<HashMap<String, RetryState>>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl QuotaMonitor {
    pub fn new(
        repository: Arc<FileRepository>,
        pool: Arc<PoolManager>,
        client: Arc<dyn UsageClient>,
        config: QuotaMonitorConfig,
    ) -> Self {
        Self {
            repository,
            pool,
            client,
            config,
            retries: Mutex::new(HashMap::new()),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &QuotaMonitorConfig {
        &self.config
    }

    /// Spawn the monitoring loop under a child of `parent`. No-op if already
    /// running.
    pub async fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            debug!("quota monitor already running");
            return;
        }

        let cancel = parent.child_token();
        let handle = tokio::spawn(Arc::clone(self).run(cancel.clone()));
        *running = Some((cancel, handle));
        info!(
            interval_secs = self.config.interval.as_secs(),
            "quota monitor started"
        );
    }

    /// Stop the loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let Some((cancel, handle)) = self.running.lock().await.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "quota monitor task ended abnormally");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                summary = self.run_once() => {
                    if summary.checked + summary.failed > 0 {
                        info!(
                            checked = summary.checked,
                            exhausted = summary.exhausted,
                            failed = summary.failed,
                            skipped = summary.skipped,
                            "quota check cycle complete"
                        );
                    }
                }
            }
        }
        info!("quota monitor stopped");
    }

    /// Check every credential once, honoring per-credential retry delays.
    pub async fn run_once(&self) -> QuotaSummary {
        let credentials = self.repository.list_all().await;
        let mut summary = QuotaSummary::default();

        for credential in &credentials {
            if !self.should_check(credential).await {
                summary.skipped += 1;
                continue;
            }
            match self.check_one(credential).await {
                Ok(exhausted) => {
                    summary.checked += 1;
                    if exhausted {
                        summary.exhausted += 1;
                    }
                    self.retries.lock().await.remove(&credential.id);
                }
                Err(e) => {
                    summary.failed += 1;
                    let delay = self.schedule_retry(&credential.id).await;
                    warn!(
                        account_id = %credential.id,
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "quota check failed"
                    );
                }
            }
        }

        // Drop retry state for credentials that left the directory
        let mut retries = self.retries.lock().await;
        retries.retain(|id, _| credentials.iter().any(|c| &c.id == id));
        summary
    }

    async fn should_check(&self, credential: &Credential) -> bool {
        if credential.access_token.is_empty() {
            return false;
        }
        if self.pool.rate_limiter().availability(&credential.id).await == Availability::Suspended {
            return false;
        }
        self.retries
            .lock()
            .await
            .get(&credential.id)
            .is_none_or(|retry| Instant::now() >= retry.not_before)
    }

    /// Returns whether the account is exhausted.
    async fn check_one(&self, credential: &Credential) -> Result<bool> {
        let mut headers = HeaderMap::new();
        self.pool.apply_fingerprint(&credential.id, &mut headers).await;

        let result = tokio::time::timeout(
            self.config.timeout,
            self.client.check_usage(credential, headers),
        )
        .await
        .map_err(|_| Error::Timeout(self.config.timeout))
        .and_then(|checked| checked.map_err(Error::Usage));

        let usage = match result {
            Ok(usage) => usage,
            Err(e) => {
                metrics::counter!("kiro_pool_quota_checks_total", "result" => "failure")
                    .increment(1);
                return Err(e);
            }
        };

        let status = usage.quota_status();
        self.pool.apply_quota(&credential.id, &status).await;

        let label = if status.is_exhausted { "exhausted" } else { "ok" };
        metrics::counter!("kiro_pool_quota_checks_total", "result" => label).increment(1);
        debug!(
            account_id = %credential.id,
            remaining = status.remaining,
            total_limit = status.total_limit,
            exhausted = status.is_exhausted,
            "quota checked"
        );
        Ok(status.is_exhausted)
    }

    async fn schedule_retry(&self, id: &str) -> Duration {
        let now = Instant::now();
        let mut retries = self.retries.lock().await;
        let state = retries.entry(id.to_string()).or_insert(RetryState {
            failures: 0,
            not_before: now,
        });
        let delay =
            exponential_backoff_with_jitter(state.failures, self.config.retry_base, self.config.retry_max);
        state.failures = state.failures.saturating_add(1);
        state.not_before = deadline_after(now, delay);
        delay
    }
}
