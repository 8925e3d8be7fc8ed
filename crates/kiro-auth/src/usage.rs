//! Usage quota checks
//!
//! Asks the CodeWhisperer service how much of an account's request quota is
//! left. The response lists one breakdown per resource type; each may carry
//! a free-trial allowance on top of the paid limit. Remaining quota is the
//! sum of every positive `limit - usage` across both.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use crate::constants::{GET_USAGE_LIMITS_TARGET, usage_endpoint};
use crate::credentials::Credential;
use crate::error::{Error, Result};

const AMZ_JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.0";

/// Body of a `GetUsageLimits` response. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageResponse {
    #[serde(default)]
    pub usage_breakdown_list: Vec<UsageBreakdown>,
    /// Next quota reset, epoch milliseconds
    #[serde(default)]
    pub next_date_reset: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBreakdown {
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub usage_limit_with_precision: f64,
    #[serde(default)]
    pub current_usage_with_precision: f64,
    #[serde(default)]
    pub free_trial_info: Option<FreeTrialInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeTrialInfo {
    #[serde(default)]
    pub free_trial_status: Option<String>,
    #[serde(default)]
    pub usage_limit_with_precision: f64,
    #[serde(default)]
    pub current_usage_with_precision: f64,
}

impl FreeTrialInfo {
    fn remaining(&self) -> f64 {
        (self.usage_limit_with_precision - self.current_usage_with_precision).max(0.0)
    }

    fn has_headroom(&self) -> bool {
        self.current_usage_with_precision < self.usage_limit_with_precision
    }
}

impl UsageBreakdown {
    fn remaining(&self) -> f64 {
        (self.usage_limit_with_precision - self.current_usage_with_precision).max(0.0)
    }

    fn has_headroom(&self) -> bool {
        self.current_usage_with_precision < self.usage_limit_with_precision
            || self.free_trial_info.as_ref().is_some_and(FreeTrialInfo::has_headroom)
    }
}

impl UsageResponse {
    /// Requests left across every breakdown and free-trial allowance.
    pub fn remaining_quota(&self) -> f64 {
        self.usage_breakdown_list
            .iter()
            .map(|b| b.remaining() + b.free_trial_info.as_ref().map_or(0.0, FreeTrialInfo::remaining))
            .sum()
    }

    /// True when no breakdown has headroom left. An empty list counts as
    /// exhausted.
    pub fn is_exhausted(&self) -> bool {
        !self.usage_breakdown_list.iter().any(UsageBreakdown::has_headroom)
    }

    /// Used share of the total limit in percent; 100 when there is no limit.
    pub fn usage_percentage(&self) -> f64 {
        let (limit, usage) = self
            .usage_breakdown_list
            .iter()
            .fold((0.0, 0.0), |(limit, usage), b| {
                let (trial_limit, trial_usage) = b.free_trial_info.as_ref().map_or((0.0, 0.0), |t| {
                    (t.usage_limit_with_precision, t.current_usage_with_precision)
                });
                (
                    limit + b.usage_limit_with_precision + trial_limit,
                    usage + b.current_usage_with_precision + trial_usage,
                )
            });
        if limit <= 0.0 {
            return 100.0;
        }
        usage / limit * 100.0
    }

    /// Next reset as a timestamp; `None` when absent or out of range.
    pub fn next_reset(&self) -> Option<DateTime<Utc>> {
        let millis = self.next_date_reset.filter(|ms| ms.is_finite() && *ms > 0.0)?;
        DateTime::from_timestamp((millis / 1000.0) as i64, 0)
    }

    /// Summary of the primary (first) breakdown, free trial included.
    pub fn quota_status(&self) -> QuotaStatus {
        let mut status = QuotaStatus {
            is_exhausted: self.is_exhausted(),
            next_reset: self.next_reset(),
            ..Default::default()
        };
        if let Some(primary) = self.usage_breakdown_list.first() {
            status.total_limit = primary.usage_limit_with_precision;
            status.current_usage = primary.current_usage_with_precision;
            status.remaining = primary.usage_limit_with_precision - primary.current_usage_with_precision;
            status.resource_type = Some(primary.resource_type.clone()).filter(|r| !r.is_empty());
            if let Some(trial) = &primary.free_trial_info {
                status.total_limit += trial.usage_limit_with_precision;
                status.current_usage += trial.current_usage_with_precision;
                status.remaining += trial.remaining();
            }
        }
        status
    }
}

/// Quota summary for one account.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuotaStatus {
    pub total_limit: f64,
    pub current_usage: f64,
    pub remaining: f64,
    pub is_exhausted: bool,
    pub resource_type: Option<String>,
    pub next_reset: Option<DateTime<Utc>>,
}

impl QuotaStatus {
    /// Remaining share of the limit in `[0, 1]`, for the health scorer.
    /// Exhausted or limitless accounts report 0.
    pub fn remaining_fraction(&self) -> f64 {
        if self.is_exhausted || self.total_limit.is_nan() || self.total_limit <= 0.0 {
            return 0.0;
        }
        (self.remaining / self.total_limit).clamp(0.0, 1.0)
    }
}

/// Boxed future returned by `UsageClient::check_usage`.
pub type UsageFuture<'a> = Pin<Box<dyn Future<Output = Result<UsageResponse>> + Send + 'a>>;

/// Fetches an account's usage limits.
///
/// `headers` carries the credential's device fingerprint; the client adds
/// the protocol and auth headers on top.
pub trait UsageClient: Send + Sync {
    fn check_usage<'a>(&'a self, credential: &'a Credential, headers: HeaderMap) -> UsageFuture<'a>;
}

/// Usage client talking to the CodeWhisperer service.
#[derive(Debug, Clone)]
pub struct HttpUsageClient {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl HttpUsageClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: None,
        }
    }

    /// Send every check to `endpoint` instead of the regional default.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    fn endpoint_for(&self, credential: &Credential) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| usage_endpoint(credential.region_or_default()))
    }

    async fn fetch(&self, credential: &Credential, mut headers: HeaderMap) -> Result<UsageResponse> {
        if credential.access_token.is_empty() {
            return Err(Error::MissingField("access_token"));
        }

        let mut bearer =
            HeaderValue::from_str(&format!("Bearer {}", credential.access_token.expose()))
                .map_err(|_| Error::UsageCheck("access token is not a valid header value".into()))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(AMZ_JSON_CONTENT_TYPE));
        headers.insert("x-amz-target", HeaderValue::from_static(GET_USAGE_LIMITS_TARGET));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let body = serde_json::json!({
            "origin": "AI_EDITOR",
            "profileArn": credential.profile_arn.as_deref().unwrap_or_default(),
            "resourceType": "AGENTIC_REQUEST",
        });

        let endpoint = self.endpoint_for(credential);
        debug!(account_id = %credential.id, endpoint = %endpoint, "checking usage limits");

        let response = self
            .client
            .post(endpoint)
            .headers(headers)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| Error::Http(format!("usage request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(Error::InvalidCredentials(format!(
                    "usage check rejected ({status}): {body}"
                )));
            }
            return Err(Error::UsageCheck(format!("usage check returned {status}: {body}")));
        }

        response
            .json::<UsageResponse>()
            .await
            .map_err(|e| Error::UsageCheck(format!("invalid usage response: {e}")))
    }
}

impl UsageClient for HttpUsageClient {
    fn check_usage<'a>(&'a self, credential: &'a Credential, headers: HeaderMap) -> UsageFuture<'a> {
        Box::pin(self.fetch(credential, headers))
    }
}
