//! Credential pool manager for Kiro OAuth accounts
//!
//! Holds many credentials at once and decides, per request, which one is
//! healthiest. Each concern is its own component with its own lock, and
//! `PoolManager` composes the in-memory ones for the proxy layer:
//!
//! - `RateLimiter`: per-credential failure backoff and suspension state machine
//! - `CooldownTracker`: provider-imposed suppression windows with a reason
//! - `TokenScorer`: rolling health metrics and weighted selection
//! - `FingerprintGenerator`: stable synthetic device identity per credential
//! - `FileRepository`: JSON credential files with atomic in-place updates
//! - `BackgroundRefresher`: periodic, bounded-concurrency token renewal
//! - `QuotaMonitor`: periodic usage checks feeding the scorer and cooldowns
//!
//! Request lifecycle:
//! 1. Proxy calls `PoolManager::select` with its candidate ids
//! 2. Outbound headers come from `PoolManager::apply_fingerprint`
//! 3. Outcome goes back through `record_success` or `report_error`
//!    (classified by `classify_status`)
//! 4. Independently, the refresher renews near-expiry tokens on disk and the
//!    quota monitor cools down accounts whose quota ran out

pub mod classify;
pub mod cooldown;
pub mod error;
pub mod fingerprint;
pub mod jitter;
pub mod pool;
pub mod quota;
pub mod rate_limiter;
pub mod refresh;
pub mod repository;
pub mod scorer;

pub use classify::{
    ErrorClassification, PhraseClassifier, SuspensionClassifier, classify_status,
    classify_status_with,
};
pub use cooldown::{CooldownReason, CooldownTracker};
pub use error::{Error, Result};
pub use fingerprint::{Fingerprint, FingerprintGenerator, OsType};
pub use jitter::HumanLikeDelay;
pub use pool::PoolManager;
pub use quota::{QuotaMonitor, QuotaMonitorConfig, QuotaSummary};
pub use rate_limiter::{Availability, RateLimiter, RateLimiterConfig, TokenState};
pub use refresh::{BackgroundRefresher, RefreshCallback, RefreshSummary, RefresherConfig};
pub use repository::FileRepository;
pub use scorer::{ScoringWeights, TokenMetrics, TokenScorer};
