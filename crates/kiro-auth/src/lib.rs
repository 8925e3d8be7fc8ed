//! Kiro OAuth credential model and token refresh
//!
//! Provides the credential record shared by the pool and the daemon, the
//! `RefreshClient` seam the background refresher calls through, and a
//! reqwest-backed implementation of it. The login flows that mint new
//! credentials live elsewhere; this crate only reads and renews them.
//!
//! Refresh routing by authentication method:
//! 1. `builder-id` / `idc` (device flow) → regional OIDC token endpoint,
//!    authenticated with the stored client id and secret
//! 2. `social` / `imported` → regional desktop auth refresh endpoint
//!
//! `UsageClient` queries the remaining request quota of an access token so
//! the pool can stop selecting exhausted accounts before the upstream
//! rejects them.

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;
pub mod usage;

pub use constants::*;
pub use credentials::{AuthMethod, Credential};
pub use error::{Error, Result};
pub use token::{HttpRefreshClient, RefreshClient, RefreshFuture, RefreshedToken, TokenResponse};
pub use usage::{HttpUsageClient, QuotaStatus, UsageBreakdown, UsageClient, UsageFuture, UsageResponse};
