//! Synthetic device fingerprints
//!
//! Each credential presents as one consistent IDE installation: a fixed SDK,
//! OS, Node and Kiro version plus browser-ish display attributes. The
//! fingerprint is drawn once per credential from fixed catalogs and then
//! reused for every request for the life of the process.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

const SDK_VERSIONS: &[&str] = &[
    "1.0.20", "1.0.21", "1.0.22", "1.0.23", "1.0.24", "1.0.25", "1.0.26", "1.0.27",
];

const NODE_VERSIONS: &[&str] = &[
    "18.17.0", "18.18.0", "18.19.0", "18.20.0", "20.9.0", "20.10.0", "20.11.0", "20.12.0",
    "20.13.0", "22.0.0", "22.1.0", "22.2.0", "22.3.0",
];

const KIRO_VERSIONS: &[&str] = &[
    "0.3.0", "0.3.1", "0.4.0", "0.4.1", "0.5.0", "0.5.1", "0.6.0", "0.6.1", "0.7.0", "0.7.1",
    "0.8.0", "0.8.1",
];

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9",
    "zh-CN,zh;q=0.9,en;q=0.8",
    "zh-TW,zh;q=0.9,en;q=0.8",
    "ja-JP,ja;q=0.9,en;q=0.8",
    "ko-KR,ko;q=0.9,en;q=0.8",
    "de-DE,de;q=0.9,en;q=0.8",
    "fr-FR,fr;q=0.9,en;q=0.8",
];

const SCREEN_RESOLUTIONS: &[&str] = &[
    "1920x1080", "2560x1440", "3840x2160", "1366x768", "1440x900", "1680x1050", "2560x1600",
    "3440x1440",
];

const COLOR_DEPTHS: &[u32] = &[24, 32];
const HARDWARE_CONCURRENCY: &[u32] = &[4, 6, 8, 10, 12, 16, 20, 24, 32];
const TIMEZONE_OFFSETS: &[i32] = &[-480, -420, -360, -300, -240, 0, 60, 120, 480, 540];

/// Operating system a fingerprint claims to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsType {
    Darwin,
    Windows,
    Linux,
}

impl OsType {
    pub const ALL: [OsType; 3] = [OsType::Darwin, OsType::Windows, OsType::Linux];

    pub fn as_str(&self) -> &'static str {
        match self {
            OsType::Darwin => "darwin",
            OsType::Windows => "windows",
            OsType::Linux => "linux",
        }
    }

    /// Plausible OS versions for this OS type.
    pub fn versions(&self) -> &'static [&'static str] {
        match self {
            OsType::Darwin => &["14.0", "14.1", "14.2", "14.3", "14.4", "14.5", "15.0", "15.1"],
            OsType::Windows => &[
                "10.0.19041",
                "10.0.19042",
                "10.0.19043",
                "10.0.19044",
                "10.0.22621",
                "10.0.22631",
            ],
            OsType::Linux => &["5.15.0", "6.1.0", "6.2.0", "6.5.0", "6.6.0", "6.8.0"],
        }
    }
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One synthetic device identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub sdk_version: &'static str,
    pub os_type: OsType,
    /// Always one of `os_type.versions()`
    pub os_version: &'static str,
    pub node_version: &'static str,
    pub kiro_version: &'static str,
    /// Hex SHA-256, unique per generated fingerprint
    pub hash: String,
    pub accept_language: &'static str,
    pub screen_resolution: &'static str,
    pub color_depth: u32,
    pub hardware_concurrency: u32,
    pub timezone_offset: i32,
}

impl Fingerprint {
    fn generate(key: &str) -> Self {
        let os_type = pick(&OsType::ALL);
        let kiro_version = pick(KIRO_VERSIONS);
        Self {
            sdk_version: pick(SDK_VERSIONS),
            os_type,
            os_version: pick(os_type.versions()),
            node_version: pick(NODE_VERSIONS),
            kiro_version,
            hash: derive_hash(key, kiro_version, os_type),
            accept_language: pick(ACCEPT_LANGUAGES),
            screen_resolution: pick(SCREEN_RESOLUTIONS),
            color_depth: pick(COLOR_DEPTHS),
            hardware_concurrency: pick(HARDWARE_CONCURRENCY),
            timezone_offset: pick(TIMEZONE_OFFSETS),
        }
    }

    /// Write every fingerprint attribute into `headers`, replacing any
    /// existing values.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let statics = [
            ("x-kiro-sdk-version", self.sdk_version),
            ("x-kiro-os-type", self.os_type.as_str()),
            ("x-kiro-os-version", self.os_version),
            ("x-kiro-node-version", self.node_version),
            ("x-kiro-version", self.kiro_version),
            ("accept-language", self.accept_language),
            ("x-screen-resolution", self.screen_resolution),
        ];
        for (name, value) in statics {
            headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        }
        if let Ok(hash) = HeaderValue::from_str(&self.hash) {
            headers.insert(HeaderName::from_static("x-kiro-hash"), hash);
        }
        headers.insert(
            HeaderName::from_static("x-color-depth"),
            HeaderValue::from(self.color_depth),
        );
        headers.insert(
            HeaderName::from_static("x-hardware-concurrency"),
            HeaderValue::from(self.hardware_concurrency),
        );
        headers.insert(
            HeaderName::from_static("x-timezone-offset"),
            HeaderValue::from(self.timezone_offset),
        );
    }

    /// Full IDE-style `User-Agent`.
    pub fn user_agent(&self) -> String {
        format!(
            "aws-sdk-js/{sdk} ua/2.1 os/{os}#{os_version} lang/js md/nodejs#{node} \
             api/codewhispererstreaming#{sdk} m/E KiroIDE-{kiro}-{hash}",
            sdk = self.sdk_version,
            os = self.os_type,
            os_version = self.os_version,
            node = self.node_version,
            kiro = self.kiro_version,
            hash = self.hash,
        )
    }

    /// Short `x-amz-user-agent` variant.
    pub fn amz_user_agent(&self) -> String {
        format!(
            "aws-sdk-js/{} KiroIDE-{}-{}",
            self.sdk_version, self.kiro_version, self.hash
        )
    }
}

fn pick<T: Copy>(choices: &[T]) -> T {
    choices[rand::rng().random_range(0..choices.len())]
}

fn derive_hash(key: &str, kiro_version: &str, os_type: OsType) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let digest = Sha256::digest(format!("{key}:{kiro_version}:{os_type}:{nanos}").as_bytes());
    hex::encode(digest)
}

/// Lazily generated, first-write-wins fingerprint per credential.
#[derive(Default)]
pub struct FingerprintGenerator {
    fingerprints: RwLock<HashMap<String, Arc<Fingerprint>>>,
}

impl FingerprintGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint for `key`, generated on first call.
    pub async fn get(&self, key: &str) -> Arc<Fingerprint> {
        if let Some(fp) = self.fingerprints.read().await.get(key) {
            return Arc::clone(fp);
        }

        let mut fingerprints = self.fingerprints.write().await;
        // Another task may have generated it between the two locks
        if let Some(fp) = fingerprints.get(key) {
            return Arc::clone(fp);
        }
        let fp = Arc::new(Fingerprint::generate(key));
        debug!(
            account_id = key,
            os = fp.os_type.as_str(),
            kiro_version = fp.kiro_version,
            "generated device fingerprint"
        );
        fingerprints.insert(key.to_string(), Arc::clone(&fp));
        fp
    }

    pub async fn remove(&self, key: &str) {
        self.fingerprints.write().await.remove(key);
    }

    pub async fn count(&self) -> usize {
        self.fingerprints.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn get_is_idempotent() {
        let generator = FingerprintGenerator::new();
        let first = generator.get("tok").await;
        let second = generator.get("tok").await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, *second);
        assert_eq!(generator.count().await, 1);
    }

    #[tokio::test]
    async fn hashes_are_distinct_across_keys() {
        let generator = FingerprintGenerator::new();
        let mut hashes = HashSet::new();
        for i in 0..100 {
            let fp = generator.get(&format!("token-{i}")).await;
            assert!(hashes.insert(fp.hash.clone()), "duplicate hash for token-{i}");
        }
        assert_eq!(generator.count().await, 100);
    }

    #[tokio::test]
    async fn attributes_come_from_catalogs() {
        let generator = FingerprintGenerator::new();
        for i in 0..100 {
            let fp = generator.get(&format!("token-{i}")).await;
            assert!(fp.os_type.versions().contains(&fp.os_version));
            assert!(SDK_VERSIONS.contains(&fp.sdk_version));
            assert!(NODE_VERSIONS.contains(&fp.node_version));
            assert!(KIRO_VERSIONS.contains(&fp.kiro_version));
            assert!(COLOR_DEPTHS.contains(&fp.color_depth));
            assert!(HARDWARE_CONCURRENCY.contains(&fp.hardware_concurrency));
            assert!(TIMEZONE_OFFSETS.contains(&fp.timezone_offset));
            assert_eq!(fp.hash.len(), 64);
            assert!(fp.hash.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[tokio::test]
    async fn remove_regenerates() {
        let generator = FingerprintGenerator::new();
        let first = generator.get("tok").await;
        generator.remove("tok").await;
        assert_eq!(generator.count().await, 0);
        let second = generator.get("tok").await;
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn apply_headers_sets_all_fields() {
        let generator = FingerprintGenerator::new();
        let fp = generator.get("tok").await;
        let mut headers = HeaderMap::new();
        headers.insert("x-kiro-version", HeaderValue::from_static("stale"));
        fp.apply_headers(&mut headers);

        assert_eq!(headers.len(), 11);
        assert_eq!(headers["x-kiro-version"], fp.kiro_version);
        assert_eq!(headers["x-kiro-os-type"], fp.os_type.as_str());
        assert_eq!(headers["x-kiro-hash"], fp.hash.as_str());
        assert_eq!(headers["accept-language"], fp.accept_language);
        assert_eq!(headers["x-color-depth"], fp.color_depth.to_string().as_str());
        assert_eq!(
            headers["x-timezone-offset"],
            fp.timezone_offset.to_string().as_str()
        );
    }

    #[test]
    fn user_agent_templates() {
        let fp = Fingerprint {
            sdk_version: "1.0.27",
            os_type: OsType::Darwin,
            os_version: "15.1",
            node_version: "20.12.0",
            kiro_version: "0.8.1",
            hash: "abc123".into(),
            accept_language: "en-US,en;q=0.9",
            screen_resolution: "1920x1080",
            color_depth: 24,
            hardware_concurrency: 8,
            timezone_offset: 0,
        };
        assert_eq!(
            fp.user_agent(),
            "aws-sdk-js/1.0.27 ua/2.1 os/darwin#15.1 lang/js md/nodejs#20.12.0 \
             api/codewhispererstreaming#1.0.27 m/E KiroIDE-0.8.1-abc123"
        );
        assert_eq!(fp.amz_user_agent(), "aws-sdk-js/1.0.27 KiroIDE-0.8.1-abc123");
    }

    #[tokio::test]
    async fn concurrent_get_returns_one_fingerprint_per_key() {
        let generator = Arc::new(FingerprintGenerator::new());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let generator = generator.clone();
            handles.push(tokio::spawn(async move { generator.get("shared").await }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(generator.count().await, 1);
    }
}
