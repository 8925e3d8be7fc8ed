//! Upstream error classification
//!
//! Maps an upstream HTTP status and response body to the pool action it
//! should trigger. Suspension detection matches free-text phrases, so the
//! matcher sits behind `SuspensionClassifier` and can be replaced when the
//! upstream exposes a structured error code.

/// Phrases in an error message that indicate a banned, suspended or
/// severely throttled account.
pub const DEFAULT_SUSPENSION_PHRASES: &[&str] = &[
    "suspend",
    "banned",
    "disabled",
    "denied",
    "rate limit",
    "rate-limit",
    "too many requests",
    "quota exceeded",
];

/// 429 body patterns that mean the account's quota is spent rather than a
/// short-lived throttle.
const QUOTA_PATTERNS: &[&str] = &[
    "quota",
    "usage limit",
    "monthly",
    "daily limit",
    "insufficient",
];

/// Decides whether an error message indicates account suspension.
pub trait SuspensionClassifier: Send + Sync {
    fn is_suspension(&self, error_text: &str) -> bool;
}

impl<F> SuspensionClassifier for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_suspension(&self, error_text: &str) -> bool {
        self(error_text)
    }
}

/// Case-insensitive substring matcher over a phrase list.
#[derive(Debug, Clone)]
pub struct PhraseClassifier {
    phrases: Vec<String>,
}

impl PhraseClassifier {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Extend the phrase list.
    pub fn with_phrase(mut self, phrase: &str) -> Self {
        let phrase = phrase.to_lowercase();
        if !phrase.is_empty() {
            self.phrases.push(phrase);
        }
        self
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }
}

impl Default for PhraseClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_SUSPENSION_PHRASES)
    }
}

impl SuspensionClassifier for PhraseClassifier {
    fn is_suspension(&self, error_text: &str) -> bool {
        let lower = error_text.to_lowercase();
        self.phrases.iter().any(|p| lower.contains(p.as_str()))
    }
}

/// What the pool should do about a failed upstream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Network error, 5xx, stale token: count a failure and back off
    Transient,
    /// 429 throttle: short exponential cooldown
    Throttled,
    /// Daily/monthly quota spent: cooldown until the next local midnight
    QuotaExhausted,
    /// Account banned or suspended: out of rotation until reset
    Suspended,
}

impl ErrorClassification {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::Transient => "transient",
            ErrorClassification::Throttled => "throttled",
            ErrorClassification::QuotaExhausted => "quota_exhausted",
            ErrorClassification::Suspended => "suspended",
        }
    }
}

/// Classify with the default phrase list.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    classify_status_with(status, body, &PhraseClassifier::default())
}

/// Classify an upstream error by HTTP status and response body.
///
/// 429 splits into quota exhaustion vs. plain throttling by body text.
/// 401/403 only count as suspension when the classifier recognizes the body;
/// otherwise the token may simply be stale, which the refresher handles.
pub fn classify_status_with(
    status: u16,
    body: &str,
    classifier: &dyn SuspensionClassifier,
) -> ErrorClassification {
    match status {
        429 => {
            let lower = body.to_lowercase();
            if QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
                ErrorClassification::QuotaExhausted
            } else {
                ErrorClassification::Throttled
            }
        }
        401 | 403 if classifier.is_suspension(body) => ErrorClassification::Suspended,
        _ => ErrorClassification::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspension_phrases_match() {
        let classifier = PhraseClassifier::default();
        for msg in [
            "Account has been suspended",
            "You are banned from this service",
            "Account disabled",
            "Access denied permanently",
            "Rate limit exceeded",
            "Too many requests",
            "Quota exceeded for today",
        ] {
            assert!(classifier.is_suspension(msg), "expected match: {msg}");
        }
    }

    #[test]
    fn ordinary_errors_do_not_match() {
        let classifier = PhraseClassifier::default();
        for msg in [
            "connection timeout",
            "internal server error",
            "bad request",
            "invalid token format",
        ] {
            assert!(!classifier.is_suspension(msg), "unexpected match: {msg}");
        }
    }

    #[test]
    fn custom_phrase_extends_list() {
        let classifier = PhraseClassifier::new(["terminated"]).with_phrase("Locked Out");
        assert!(classifier.is_suspension("account TERMINATED"));
        assert!(classifier.is_suspension("user locked out"));
        assert!(!classifier.is_suspension("account suspended"));
    }

    #[test]
    fn closure_is_a_classifier() {
        let by_code = |text: &str| text.contains("ACCOUNT_SUSPENDED");
        assert_eq!(
            classify_status_with(403, r#"{"code":"ACCOUNT_SUSPENDED"}"#, &by_code),
            ErrorClassification::Suspended
        );
        assert_eq!(
            classify_status_with(403, "account suspended", &by_code),
            ErrorClassification::Transient
        );
    }

    #[test]
    fn classify_429_quota() {
        let body = r#"{"message":"Monthly usage limit reached"}"#;
        assert_eq!(classify_status(429, body), ErrorClassification::QuotaExhausted);
        assert_eq!(
            classify_status(429, "insufficient model request quota"),
            ErrorClassification::QuotaExhausted
        );
    }

    #[test]
    fn classify_429_throttle() {
        assert_eq!(
            classify_status(429, "Too many requests, slow down"),
            ErrorClassification::Throttled
        );
        assert_eq!(classify_status(429, ""), ErrorClassification::Throttled);
    }

    #[test]
    fn classify_403_suspended() {
        let body = r#"{"message":"Your account has been suspended"}"#;
        assert_eq!(classify_status(403, body), ErrorClassification::Suspended);
    }

    #[test]
    fn classify_401_stale_token_is_transient() {
        assert_eq!(
            classify_status(401, "The security token included in the request is expired"),
            ErrorClassification::Transient
        );
    }

    #[test]
    fn classify_5xx_transient() {
        for status in [500, 502, 503, 504, 408] {
            assert_eq!(classify_status(status, "suspended"), ErrorClassification::Transient);
        }
    }
}
