//! Proactive background token refresh
//!
//! On every tick the refresher asks the repository for stale device-flow
//! credentials and renews them through the `RefreshClient`, at most
//! `concurrency` at a time. Each refresh has its own timeout. A failed
//! refresh is logged and counted; it never stops the batch or the loop.
//!
//! Cancelling the token passed to `start` (or calling `stop`) ends the loop
//! promptly. Refreshes already dispatched are detached tasks and finish on
//! their own, so a credential file is never abandoned mid-write.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kiro_auth::{Credential, RefreshClient};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::repository::FileRepository;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RefresherConfig {
    pub interval: Duration,
    /// Most credentials taken from one scan; 0 means all
    pub batch_size: usize,
    /// Most refreshes in flight at once
    pub concurrency: usize,
    /// Per-refresh deadline
    pub timeout: Duration,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REFRESH_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }
}

/// Called with the credential id and the persisted credential after each
/// successful refresh.
pub type RefreshCallback = Arc<dyn Fn(&str, &Credential) + Send + Sync>;

/// Outcome counts for one refresh cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub scanned: usize,
    pub refreshed: usize,
    pub failed: usize,
}

pub struct BackgroundRefresher {
    repository: Arc<FileRepository>,
    client: Arc<dyn RefreshClient>,
    config: RefresherConfig,
    on_refreshed: RwLock<Option<RefreshCallback>>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl BackgroundRefresher {
    pub fn new(
        repository: Arc<FileRepository>,
        client: Arc<dyn RefreshClient>,
        config: RefresherConfig,
    ) -> Self {
        Self {
            repository,
            client,
            config,
            on_refreshed: RwLock::new(None),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RefresherConfig {
        &self.config
    }

    /// Register the success callback. Safe to call while running; the next
    /// cycle picks it up.
    pub async fn set_on_refreshed(&self, callback: RefreshCallback) {
        *self.on_refreshed.write().await = Some(callback);
    }

    /// Spawn the refresh loop under a child of `parent`. No-op if already
    /// running.
    pub async fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            debug!("background refresher already running");
            return;
        }

        let cancel = parent.child_token();
        let handle = tokio::spawn(Arc::clone(self).run(cancel.clone()));
        *running = Some((cancel, handle));
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "background refresher started"
        );
    }

    /// Stop the loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let Some((cancel, handle)) = self.running.lock().await.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "background refresher task ended abnormally");
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
                    if summary.scanned > 0 {
                        info!(
                            scanned = summary.scanned,
                            refreshed = summary.refreshed,
                            failed = summary.failed,
                            "refresh cycle complete"
                        );
                    }
                }
            }
        }
        info!("background refresher stopped");
    }

    /// Run one scan and refresh every stale credential it finds.
    pub async fn run_once(&self) -> RefreshSummary {
        let stale = self.repository.find_stale(self.config.batch_size).await;
        let mut summary = RefreshSummary {
            scanned: stale.len(),
            ..Default::default()
        };
        if stale.is_empty() {
            return summary;
        }
        debug!(count = stale.len(), "refreshing stale credentials");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let callback = self.on_refreshed.read().await.clone();
        let mut handles = Vec::with_capacity(stale.len());

        for credential in stale {
            // Permit before spawn keeps the number of live tasks bounded too
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let repository = Arc::clone(&self.repository);
            let client = Arc::clone(&self.client);
            let callback = callback.clone();
            let timeout = self.config.timeout;
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                refresh_one(
                    &repository,
                    client.as_ref(),
                    &credential,
                    timeout,
                    callback.as_ref(),
                )
                .await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => summary.refreshed += 1,
                Ok(Err(_)) => summary.failed += 1,
                Err(e) => {
                    warn!(error = %e, "refresh task panicked");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}

async fn refresh_one(
    repository: &FileRepository,
    client: &dyn RefreshClient,
    credential: &Credential,
    timeout: Duration,
    callback: Option<&RefreshCallback>,
) -> Result<()> {
    let result = async {
        let refreshed = tokio::time::timeout(timeout, client.refresh(credential))
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        let updated = credential.with_refreshed(refreshed, Utc::now());
        repository.update(&updated).await?;
        Ok::<_, Error>(updated)
    }
    .await;

    match result {
        Ok(updated) => {
            metrics::counter!("kiro_pool_refresh_total", "result" => "success").increment(1);
            info!(
                account_id = %updated.id,
                auth_method = updated.auth_method.as_str(),
                "background token refresh succeeded"
            );
            if let Some(callback) = callback {
                callback(&updated.id, &updated);
            }
            Ok(())
        }
        Err(e) => {
            metrics::counter!("kiro_pool_refresh_total", "result" => "failure").increment(1);
            warn!(account_id = %credential.id, error = %e, "background token refresh failed");
            Err(e)
        }
    }
}
