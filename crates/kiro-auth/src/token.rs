//! Token refresh
//!
//! Two refresh paths, chosen by the credential's authentication method:
//! 1. Device flow (builder-id / idc): POST to the regional OIDC token endpoint
//!    with the stored client id and secret
//! 2. Social / imported: POST to the regional desktop auth refresh endpoint
//!    with just the refresh token
//!
//! Both respond with an access token, an optionally rotated refresh token and
//! an `expiresIn` delta in seconds.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{OIDC_AMZ_USER_AGENT, oidc_token_endpoint, social_refresh_endpoint};
use crate::credentials::Credential;
use crate::error::{Error, Result};

/// Response body from either refresh endpoint.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub profile_arn: Option<String>,
}

impl TokenResponse {
    /// Convert the relative expiry into an absolute timestamp.
    ///
    /// An `expiresIn` that does not fit a timestamp is a `TokenExchange`
    /// error, not a panic.
    pub fn into_refreshed(self, now: DateTime<Utc>) -> Result<RefreshedToken> {
        let expires_at = match self.expires_in {
            Some(secs) => Some(
                TimeDelta::try_seconds(secs)
                    .and_then(|delta| now.checked_add_signed(delta))
                    .ok_or_else(|| {
                        Error::TokenExchange(format!("expiresIn out of range: {secs}"))
                    })?,
            ),
            None => None,
        };
        Ok(RefreshedToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            profile_arn: self.profile_arn,
        })
    }
}

/// Outcome of a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Present only when the endpoint rotated the refresh token
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub profile_arn: Option<String>,
}

/// Boxed future returned by `RefreshClient::refresh`.
pub type RefreshFuture<'a> = Pin<Box<dyn Future<Output = Result<RefreshedToken>> + Send + 'a>>;

/// Renews a credential's access token.
///
/// Uses a boxed future return type so the refresher can hold an
/// `Arc<dyn RefreshClient>` and tests can substitute a fake.
pub trait RefreshClient: Send + Sync {
    fn refresh<'a>(&'a self, credential: &'a Credential) -> RefreshFuture<'a>;
}

/// Refresh client talking to the real Kiro / AWS endpoints.
#[derive(Debug, Clone)]
pub struct HttpRefreshClient {
    client: reqwest::Client,
}

impl HttpRefreshClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn refresh_device_flow(&self, credential: &Credential) -> Result<RefreshedToken> {
        let client_id = credential
            .client_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(Error::MissingField("client_id"))?;
        let client_secret = credential
            .client_secret
            .as_ref()
            .filter(|s| !s.is_empty())
            .ok_or(Error::MissingField("client_secret"))?;

        let region = credential.region_or_default();
        debug!(account_id = %credential.id, region, "refreshing device-flow token");

        let body = serde_json::json!({
            "clientId": client_id,
            "clientSecret": client_secret.expose(),
            "refreshToken": credential.refresh_token.expose(),
            "grantType": "refresh_token",
        });

        let response = self
            .client
            .post(oidc_token_endpoint(region))
            .header("x-amz-user-agent", OIDC_AMZ_USER_AGENT)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("OIDC refresh request failed: {e}")))?;

        parse_response(response).await
    }

    async fn refresh_social(&self, credential: &Credential) -> Result<RefreshedToken> {
        let region = credential.region_or_default();
        debug!(account_id = %credential.id, region, "refreshing social token");

        let body = serde_json::json!({
            "refreshToken": credential.refresh_token.expose(),
        });

        let response = self
            .client
            .post(social_refresh_endpoint(region))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("social refresh request failed: {e}")))?;

        parse_response(response).await
    }
}

impl RefreshClient for HttpRefreshClient {
    fn refresh<'a>(&'a self, credential: &'a Credential) -> RefreshFuture<'a> {
        Box::pin(async move {
            if !credential.is_refreshable() {
                return Err(Error::MissingField("refresh_token"));
            }
            if credential.auth_method.is_device_flow() {
                self.refresh_device_flow(credential).await
            } else {
                self.refresh_social(credential).await
            }
        })
    }
}

/// Map the HTTP response to a refreshed token or a classified error.
async fn parse_response(response: reqwest::Response) -> Result<RefreshedToken> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        // 401/403 means the refresh token is revoked or invalid
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    let token = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?;
    token.into_refreshed(Utc::now())
}
