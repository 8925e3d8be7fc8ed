//! Kiro credential record
//!
//! One `Credential` per JSON file in the auth directory. The identifier is
//! derived from the file's location and never changes; tokens and expiry are
//! rewritten in place by the background refresher.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use common::Secret;

use crate::constants::DEFAULT_REGION;
use crate::token::RefreshedToken;

/// How a credential was obtained, which decides how it is refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// AWS Builder ID device flow
    BuilderId,
    /// AWS IAM Identity Center device flow
    Idc,
    /// Social login (Google/GitHub) through the desktop auth service
    Social,
    /// Token imported from an existing IDE installation
    Imported,
}

impl AuthMethod {
    /// Wire value stored in the `auth_method` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::BuilderId => "builder-id",
            AuthMethod::Idc => "idc",
            AuthMethod::Social => "social",
            AuthMethod::Imported => "imported",
        }
    }

    /// Device-flow credentials refresh through OIDC with a client id/secret.
    pub fn is_device_flow(&self) -> bool {
        matches!(self, AuthMethod::BuilderId | AuthMethod::Idc)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "builder-id" => Ok(AuthMethod::BuilderId),
            "idc" => Ok(AuthMethod::Idc),
            "social" => Ok(AuthMethod::Social),
            "imported" => Ok(AuthMethod::Imported),
            other => Err(format!("unknown auth method: {other}")),
        }
    }
}

/// One OAuth-authenticated Kiro account.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Path of the backing file relative to the auth directory
    pub id: String,
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    /// `None` when the file has no parseable expiry
    pub expires_at: Option<DateTime<Utc>>,
    pub auth_method: AuthMethod,
    pub provider: Option<String>,
    /// Device flow only
    pub client_id: Option<String>,
    /// Device flow only
    pub client_secret: Option<Secret<String>>,
    pub region: Option<String>,
    /// IDC only
    pub start_url: Option<String>,
    pub email: Option<String>,
    pub profile_arn: Option<String>,
    pub last_refresh: Option<DateTime<Utc>>,
}

impl Credential {
    /// Minimal credential with only the identity, tokens and method set.
    pub fn new(
        id: impl Into<String>,
        auth_method: AuthMethod,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            access_token: Secret::new(access_token.into()),
            refresh_token: Secret::new(refresh_token.into()),
            expires_at: None,
            auth_method,
            provider: None,
            client_id: None,
            client_secret: None,
            region: None,
            start_url: None,
            email: None,
            profile_arn: None,
            last_refresh: None,
        }
    }

    /// A credential without a refresh token can never be renewed.
    pub fn is_refreshable(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// True when the expiry is unknown or falls within `window` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => expires_at - now < window,
        }
    }

    /// Region to refresh against, falling back to the default.
    pub fn region_or_default(&self) -> &str {
        self.region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REGION)
    }

    /// Produce the post-refresh credential.
    ///
    /// The refresh token is only replaced when the endpoint rotated it, and
    /// the expiry only moves forward.
    pub fn with_refreshed(&self, refreshed: RefreshedToken, now: DateTime<Utc>) -> Credential {
        let mut next = self.clone();
        next.access_token = Secret::new(refreshed.access_token);
        if let Some(rotated) = refreshed.refresh_token.filter(|t| !t.is_empty()) {
            next.refresh_token = Secret::new(rotated);
        }
        if let Some(new_expiry) = refreshed.expires_at {
            next.expires_at = match self.expires_at {
                Some(old) if old > new_expiry => Some(old),
                _ => Some(new_expiry),
            };
        }
        if refreshed.profile_arn.is_some() {
            next.profile_arn = refreshed.profile_arn;
        }
        next.last_refresh = Some(now);
        next
    }
}
