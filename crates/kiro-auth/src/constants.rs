//! Kiro provider constants
//!
//! Identify which credential files belong to this provider and where the
//! refresh endpoints live. None of these are secrets.

/// Value of the `type` field in every Kiro credential file.
pub const PROVIDER_TYPE: &str = "kiro";

/// Filename prefix marking a credential file as Kiro-owned.
pub const CREDENTIAL_FILE_PREFIX: &str = "kiro-";

/// Region used when a credential does not carry one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// `x-amz-user-agent` sent with OIDC refresh requests.
pub const OIDC_AMZ_USER_AGENT: &str =
    "aws-sdk-js/3.738.0 ua/2.1 os/other lang/js md/browser#unknown_unknown api/sso-oidc#3.738.0 m/E KiroIDE";

/// `x-amz-target` of the usage-limits call.
pub const GET_USAGE_LIMITS_TARGET: &str = "AmazonCodeWhispererService.GetUsageLimits";

/// OIDC token endpoint for device-flow (builder-id / idc) refresh.
pub fn oidc_token_endpoint(region: &str) -> String {
    format!("https://oidc.{region}.amazonaws.com/token")
}

/// Desktop auth endpoint for social / imported refresh.
pub fn social_refresh_endpoint(region: &str) -> String {
    format!("https://prod.{region}.auth.desktop.kiro.dev/refreshToken")
}

/// CodeWhisperer service endpoint answering usage-limit queries.
pub fn usage_endpoint(region: &str) -> String {
    format!("https://codewhisperer.{region}.amazonaws.com")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_embed_region() {
        assert_eq!(
            oidc_token_endpoint("eu-west-1"),
            "https://oidc.eu-west-1.amazonaws.com/token"
        );
        assert_eq!(
            social_refresh_endpoint(DEFAULT_REGION),
            "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken"
        );
        assert_eq!(
            usage_endpoint("us-west-2"),
            "https://codewhisperer.us-west-2.amazonaws.com"
        );
    }
}
