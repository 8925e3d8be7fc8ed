//! File-backed credential repository
//!
//! One JSON file per credential under a base directory, named `kiro-*.json`.
//! A credential's id is its path relative to the base directory. Scans are
//! best effort: unreadable, malformed or foreign files are skipped and never
//! abort the walk. Updates merge into the existing JSON object so fields this
//! crate does not know about survive, and land on disk through a temp file
//! plus rename so readers never see a half-written file.

use std::cmp::Ordering;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use common::Secret;
use kiro_auth::{AuthMethod, CREDENTIAL_FILE_PREFIX, Credential, PROVIDER_TYPE};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Credentials expiring within this window are due for refresh.
pub const DEFAULT_STALE_WINDOW: chrono::Duration = chrono::Duration::minutes(5);

type JsonObject = Map<String, Value>;

pub struct FileRepository {
    base_dir: RwLock<Option<PathBuf>>,
    stale_window: chrono::Duration,
}

impl FileRepository {
    /// `None` leaves the repository unconfigured: scans return nothing and
    /// updates fail with `NotConfigured`.
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self {
            base_dir: RwLock::new(base_dir.filter(|d| !d.as_os_str().is_empty())),
            stale_window: DEFAULT_STALE_WINDOW,
        }
    }

    pub fn with_stale_window(mut self, window: chrono::Duration) -> Self {
        self.stale_window = window;
        self
    }

    /// Point the repository at a different directory. An empty path
    /// unconfigures it.
    pub async fn set_base_dir(&self, dir: Option<PathBuf>) {
        *self.base_dir.write().await = dir.filter(|d| !d.as_os_str().is_empty());
    }

    pub async fn base_dir(&self) -> Option<PathBuf> {
        self.base_dir.read().await.clone()
    }

    /// Device-flow credentials that expire within the stale window (or have
    /// no known expiry), oldest `last_refresh` first, at most `limit` of them.
    /// A `limit` of 0 means no limit.
    pub async fn find_stale(&self, limit: usize) -> Vec<Credential> {
        let now = Utc::now();
        let mut stale: Vec<Credential> = self
            .scan()
            .await
            .into_iter()
            .filter(|c| c.auth_method.is_device_flow())
            .filter(|c| c.is_refreshable())
            .filter(|c| c.expires_within(now, self.stale_window))
            .collect();

        stale.sort_by(|a, b| compare_last_refresh(a.last_refresh, b.last_refresh));
        if limit > 0 {
            stale.truncate(limit);
        }
        stale
    }

    /// Every provider credential regardless of method or expiry.
    pub async fn list_all(&self) -> Vec<Credential> {
        let mut all = self.scan().await;
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Persist a refreshed credential.
    ///
    /// Tokens and `last_refresh` are always overwritten; the remaining known
    /// fields only when non-empty, and `expires_at` only if it does not move
    /// an expiry already on disk backwards.
    pub async fn update(&self, credential: &Credential) -> Result<()> {
        let base = self
            .base_dir()
            .await
            .ok_or_else(|| Error::NotConfigured("auth directory not set".into()))?;
        let path = follow_link(resolve_path(&base, &credential.id)?).await?;

        let mut object = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<JsonObject>(&bytes).unwrap_or_else(|e| {
                warn!(account_id = %credential.id, error = %e, "existing credential file unparseable, rewriting");
                JsonObject::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => JsonObject::new(),
            Err(e) => return Err(Error::Io(format!("reading {}: {e}", path.display()))),
        };

        merge_credential(&mut object, credential, Utc::now());

        if let Some(parent) = path.parent() {
            create_private_dir(parent).await?;
        }
        let json = serde_json::to_string_pretty(&Value::Object(object))
            .map_err(|e| Error::Parse(format!("serializing credential: {e}")))?;
        write_atomic(&path, json.as_bytes()).await?;

        debug!(account_id = %credential.id, "persisted credential");
        Ok(())
    }

    /// Walk the base directory and parse every provider credential file.
    async fn scan(&self) -> Vec<Credential> {
        let Some(base) = self.base_dir().await else {
            debug!("credential repository not configured, nothing to scan");
            return Vec::new();
        };

        let mut found = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                    continue;
                }
            };
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(dir = %dir.display(), error = %e, "directory walk interrupted");
                        break;
                    }
                };
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                // Links to files count; linked directories are not descended
                let is_file = if file_type.is_symlink() {
                    tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file())
                } else {
                    file_type.is_file()
                };
                if !is_file || !is_credential_file_name(&entry.file_name()) {
                    continue;
                }
                match read_credential(&base, &path).await {
                    Ok(Some(credential)) => found.push(credential),
                    Ok(None) => {}
                    Err(e) => debug!(path = %path.display(), error = %e, "skipping credential file"),
                }
            }
        }
        found
    }
}

/// Target of `path` when it is a symlink, so an update rewrites the linked
/// file instead of replacing the link.
async fn follow_link(path: PathBuf) -> Result<PathBuf> {
    match tokio::fs::symlink_metadata(&path).await {
        Ok(meta) if meta.file_type().is_symlink() => tokio::fs::canonicalize(&path)
            .await
            .map_err(|e| Error::Io(format!("resolving link {}: {e}", path.display()))),
        _ => Ok(path),
    }
}

fn is_credential_file_name(name: &std::ffi::OsStr) -> bool {
    let Some(name) = name.to_str() else {
        return false;
    };
    name.starts_with(CREDENTIAL_FILE_PREFIX) && name.to_ascii_lowercase().ends_with(".json")
}

/// Never-refreshed credentials sort first.
fn compare_last_refresh(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

/// Relative path of `path` under `base` with `/` separators.
fn credential_id(base: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Map a credential id back to a path inside `base`.
fn resolve_path(base: &Path, id: &str) -> Result<PathBuf> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidId("empty id".into()));
    }
    let relative = Path::new(trimmed);
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(Error::InvalidId(id.to_string()));
    }
    let mut path = base.join(relative);
    if !trimmed.to_ascii_lowercase().ends_with(".json") {
        let name = format!("{}.json", file_name_of(&path));
        path.set_file_name(name);
    }
    Ok(path)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn read_credential(base: &Path, path: &Path) -> Result<Option<Credential>> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| Error::Io(format!("reading {}: {e}", path.display())))?;
    let object: JsonObject = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Parse(format!("{}: {e}", path.display())))?;
    Ok(parse_credential(credential_id(base, path), &object))
}

/// Build a credential from a file's JSON object. `None` for other providers'
/// files and unknown auth methods.
fn parse_credential(id: String, object: &JsonObject) -> Option<Credential> {
    if str_field(object, "type") != Some(PROVIDER_TYPE) {
        return None;
    }
    let auth_method: AuthMethod = str_field(object, "auth_method")?.parse().ok()?;

    let mut credential = Credential::new(
        id,
        auth_method,
        str_field(object, "access_token").unwrap_or_default(),
        str_field(object, "refresh_token").unwrap_or_default(),
    );
    credential.expires_at = time_field(object, "expires_at");
    credential.last_refresh = time_field(object, "last_refresh");
    credential.provider = owned_field(object, "provider");
    credential.client_id = owned_field(object, "client_id");
    credential.client_secret = owned_field(object, "client_secret").map(Secret::new);
    credential.region = owned_field(object, "region");
    credential.start_url = owned_field(object, "start_url");
    credential.email = owned_field(object, "email");
    credential.profile_arn = owned_field(object, "profile_arn");
    Some(credential)
}

fn str_field<'a>(object: &'a JsonObject, key: &str) -> Option<&'a str> {
    object.get(key).and_then(Value::as_str)
}

fn owned_field(object: &JsonObject, key: &str) -> Option<String> {
    str_field(object, key)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn time_field(object: &JsonObject, key: &str) -> Option<DateTime<Utc>> {
    str_field(object, key)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn merge_credential(object: &mut JsonObject, credential: &Credential, now: DateTime<Utc>) {
    let mut set = |key: &str, value: String| {
        object.insert(key.to_string(), Value::String(value));
    };
    set("access_token", credential.access_token.expose().clone());
    set("refresh_token", credential.refresh_token.expose().clone());
    set("last_refresh", rfc3339(now));
    set("auth_method", credential.auth_method.as_str().to_string());

    let optional = [
        ("provider", credential.provider.as_deref()),
        ("client_id", credential.client_id.as_deref()),
        (
            "client_secret",
            credential.client_secret.as_ref().map(|s| s.expose().as_str()),
        ),
        ("region", credential.region.as_deref()),
        ("start_url", credential.start_url.as_deref()),
        ("email", credential.email.as_deref()),
        ("profile_arn", credential.profile_arn.as_deref()),
    ];
    for (key, value) in optional {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            set(key, value.to_string());
        }
    }

    if let Some(expires_at) = credential.expires_at {
        let on_disk = time_field(object, "expires_at");
        if on_disk.is_none_or(|existing| existing <= expires_at) {
            object.insert("expires_at".into(), Value::String(rfc3339(expires_at)));
        }
    }

    object
        .entry("type")
        .or_insert_with(|| Value::String(PROVIDER_TYPE.to_string()));
}

async fn create_private_dir(dir: &Path) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder
        .create(dir)
        .await
        .map_err(|e| Error::Io(format!("creating {}: {e}", dir.display())))
}

/// Write `data` to `path` through a uniquely named temp file in the same
/// directory, then rename it over the target.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(
        ".{}.{}.tmp",
        file_name_of(path),
        uuid::Uuid::new_v4()
    ));

    tokio::fs::write(&tmp_path, data)
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = tokio::fs::set_permissions(&tmp_path, perms).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::Io(format!("setting credential file permissions: {e}")));
        }
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(Error::Io(format!("renaming temp credential file: {e}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn write_json(dir: &Path, name: &str, value: Value) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(&value).unwrap())
            .await
            .unwrap();
    }

    fn device_file(expires_at: Option<DateTime<Utc>>, last_refresh: Option<DateTime<Utc>>) -> Value {
        let mut value = serde_json::json!({
            "type": "kiro",
            "auth_method": "idc",
            "access_token": "at",
            "refresh_token": "rt",
            "client_id": "cid",
            "client_secret": "csecret",
            "region": "us-east-1",
            "start_url": "https://example.awsapps.com/start",
        });
        if let Some(t) = expires_at {
            value["expires_at"] = Value::String(rfc3339(t));
        }
        if let Some(t) = last_refresh {
            value["last_refresh"] = Value::String(rfc3339(t));
        }
        value
    }

    async fn read_object(path: &Path) -> JsonObject {
        serde_json::from_slice(&tokio::fs::read(path).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn unconfigured_repository_degrades() {
        let repo = FileRepository::new(None);
        assert!(repo.find_stale(0).await.is_empty());
        assert!(repo.list_all().await.is_empty());

        let cred = Credential::new("kiro-a.json", AuthMethod::Idc, "at", "rt");
        let err = repo.update(&cred).await.unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)), "got {err}");
    }

    #[tokio::test]
    async fn missing_directory_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::new(Some(dir.path().join("does-not-exist")));
        assert!(repo.find_stale(0).await.is_empty());
    }

    #[tokio::test]
    async fn find_stale_filters_and_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let soon = Some(now + chrono::Duration::minutes(1));
        let later = Some(now + chrono::Duration::hours(2));

        write_json(dir.path(), "kiro-expiring.json", device_file(soon, None)).await;
        write_json(dir.path(), "kiro-fresh.json", device_file(later, None)).await;
        write_json(dir.path(), "kiro-unknown-expiry.json", device_file(None, None)).await;
        write_json(dir.path(), "nested/kiro-deep.JSON", device_file(soon, None)).await;

        let mut social = device_file(soon, None);
        social["auth_method"] = "social".into();
        write_json(dir.path(), "kiro-social.json", social).await;

        let mut other_type = device_file(soon, None);
        other_type["type"] = "claude".into();
        write_json(dir.path(), "kiro-other.json", other_type).await;

        let mut no_refresh = device_file(soon, None);
        no_refresh["refresh_token"] = "".into();
        write_json(dir.path(), "kiro-norefresh.json", no_refresh).await;

        write_json(dir.path(), "gemini-expiring.json", device_file(soon, None)).await;
        tokio::fs::write(dir.path().join("kiro-broken.json"), b"{not json")
            .await
            .unwrap();

        let repo = FileRepository::new(Some(dir.path().to_path_buf()));
        let mut ids: Vec<String> = repo.find_stale(0).await.into_iter().map(|c| c.id).collect();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                "kiro-expiring.json",
                "kiro-unknown-expiry.json",
                "nested/kiro-deep.JSON"
            ]
        );
    }

    #[tokio::test]
    async fn find_stale_orders_oldest_first_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let soon = Some(now + chrono::Duration::minutes(1));

        write_json(
            dir.path(),
            "kiro-recent.json",
            device_file(soon, Some(now - chrono::Duration::minutes(1))),
        )
        .await;
        write_json(
            dir.path(),
            "kiro-old.json",
            device_file(soon, Some(now - chrono::Duration::hours(5))),
        )
        .await;
        write_json(dir.path(), "kiro-never.json", device_file(soon, None)).await;

        let repo = FileRepository::new(Some(dir.path().to_path_buf()));
        let ids: Vec<String> = repo.find_stale(0).await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["kiro-never.json", "kiro-old.json", "kiro-recent.json"]);

        let limited = repo.find_stale(2).await;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, "kiro-never.json");
    }

    #[tokio::test]
    async fn parsed_fields_match_file() {
        let dir = tempfile::tempdir().unwrap();
        let expires = Utc::now() + chrono::Duration::minutes(1);
        write_json(dir.path(), "kiro-a.json", device_file(Some(expires), None)).await;

        let repo = FileRepository::new(Some(dir.path().to_path_buf()));
        let cred = repo.find_stale(0).await.pop().unwrap();
        assert_eq!(cred.auth_method, AuthMethod::Idc);
        assert_eq!(cred.client_id.as_deref(), Some("cid"));
        assert_eq!(cred.client_secret.as_ref().unwrap().expose(), "csecret");
        assert_eq!(cred.start_url.as_deref(), Some("https://example.awsapps.com/start"));
        assert_eq!(
            cred.expires_at.map(|t| t.timestamp()),
            Some(expires.timestamp())
        );
    }

    #[tokio::test]
    async fn list_all_includes_social_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let later = Some(Utc::now() + chrono::Duration::hours(2));
        write_json(dir.path(), "kiro-idc.json", device_file(later, None)).await;
        let mut social = device_file(later, None);
        social["auth_method"] = "social".into();
        write_json(dir.path(), "kiro-social.json", social).await;

        let repo = FileRepository::new(Some(dir.path().to_path_buf()));
        let ids: Vec<String> = repo.list_all().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["kiro-idc.json", "kiro-social.json"]);
    }

    #[tokio::test]
    async fn update_round_trips_and_preserves_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut original = device_file(Some(Utc::now()), None);
        original["custom_note"] = "keep me".into();
        original["nested"] = serde_json::json!({"a": [1, 2, 3]});
        write_json(dir.path(), "kiro-a.json", original).await;

        let repo = FileRepository::new(Some(dir.path().to_path_buf()));
        let mut cred = repo.find_stale(0).await.pop().unwrap();
        let new_expiry = Utc::now() + chrono::Duration::hours(1);
        cred.access_token = Secret::new("at_new".to_string());
        cred.refresh_token = Secret::new("rt_new".to_string());
        cred.expires_at = Some(new_expiry);
        cred.region = Some("eu-west-1".into());
        repo.update(&cred).await.unwrap();

        let object = read_object(&dir.path().join("kiro-a.json")).await;
        assert_eq!(object["custom_note"], "keep me");
        assert_eq!(object["nested"], serde_json::json!({"a": [1, 2, 3]}));
        assert_eq!(object["type"], "kiro");
        assert!(object.contains_key("last_refresh"));

        let reread = repo.list_all().await.pop().unwrap();
        assert_eq!(reread.access_token.expose(), "at_new");
        assert_eq!(reread.refresh_token.expose(), "rt_new");
        assert_eq!(
            reread.expires_at.map(|t| t.timestamp()),
            Some(new_expiry.timestamp())
        );
        assert_eq!(reread.client_id.as_deref(), Some("cid"));
        assert_eq!(reread.client_secret.as_ref().unwrap().expose(), "csecret");
        assert_eq!(reread.region.as_deref(), Some("eu-west-1"));
        assert_eq!(reread.start_url, cred.start_url);
        assert!(reread.last_refresh.is_some());
    }

    #[tokio::test]
    async fn update_never_regresses_expiry_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let far = Utc::now() + chrono::Duration::hours(10);
        write_json(dir.path(), "kiro-a.json", device_file(Some(far), None)).await;

        let repo = FileRepository::new(Some(dir.path().to_path_buf()));
        let mut cred = Credential::new("kiro-a.json", AuthMethod::Idc, "at2", "rt2");
        cred.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
        repo.update(&cred).await.unwrap();

        let object = read_object(&dir.path().join("kiro-a.json")).await;
        assert_eq!(object["expires_at"], rfc3339(far));
        assert_eq!(object["access_token"], "at2");
    }

    #[tokio::test]
    async fn update_creates_missing_file_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::new(Some(dir.path().to_path_buf()));
        let cred = Credential::new("team/kiro-new", AuthMethod::BuilderId, "at", "rt");
        repo.update(&cred).await.unwrap();

        let path = dir.path().join("team/kiro-new.json");
        let object = read_object(&path).await;
        assert_eq!(object["type"], "kiro");
        assert_eq!(object["auth_method"], "builder-id");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
        }
    }

    #[tokio::test]
    async fn update_rejects_escaping_ids() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::new(Some(dir.path().join("auth")));
        for id in ["../kiro-x.json", "/etc/kiro-x.json", "  "] {
            let cred = Credential::new(id, AuthMethod::Idc, "at", "rt");
            let err = repo.update(&cred).await.unwrap_err();
            assert!(matches!(err, Error::InvalidId(_)), "{id}: got {err}");
        }
    }

    #[tokio::test]
    async fn update_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::new(Some(dir.path().to_path_buf()));
        let cred = Credential::new("kiro-a.json", AuthMethod::Idc, "at", "rt");
        repo.update(&cred).await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["kiro-a.json"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_credential_files_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let soon = Some(Utc::now() + chrono::Duration::minutes(1));
        write_json(store.path(), "account.json", device_file(soon, None)).await;
        std::os::unix::fs::symlink(
            store.path().join("account.json"),
            dir.path().join("kiro-linked.json"),
        )
        .unwrap();
        std::os::unix::fs::symlink(
            store.path().join("missing.json"),
            dir.path().join("kiro-dangling.json"),
        )
        .unwrap();

        let repo = FileRepository::new(Some(dir.path().to_path_buf()));
        let ids: Vec<String> = repo.list_all().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["kiro-linked.json"]);
        assert_eq!(repo.find_stale(0).await.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn update_through_symlink_writes_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        write_json(store.path(), "account.json", device_file(None, None)).await;
        let link = dir.path().join("kiro-linked.json");
        std::os::unix::fs::symlink(store.path().join("account.json"), &link).unwrap();

        let repo = FileRepository::new(Some(dir.path().to_path_buf()));
        let mut cred = repo.list_all().await.remove(0);
        cred.access_token = "at_rotated".into();
        repo.update(&cred).await.unwrap();

        let meta = tokio::fs::symlink_metadata(&link).await.unwrap();
        assert!(meta.file_type().is_symlink(), "link was replaced by a file");
        let target = read_object(&store.path().join("account.json")).await;
        assert_eq!(target["access_token"], "at_rotated");
    }

    #[tokio::test]
    async fn set_base_dir_switches_directory() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write_json(second.path(), "kiro-a.json", device_file(None, None)).await;

        let repo = FileRepository::new(Some(first.path().to_path_buf()));
        assert!(repo.find_stale(0).await.is_empty());

        repo.set_base_dir(Some(second.path().to_path_buf())).await;
        assert_eq!(repo.base_dir().await.as_deref(), Some(second.path()));
        assert_eq!(repo.find_stale(0).await.len(), 1);

        repo.set_base_dir(None).await;
        assert!(repo.base_dir().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_updates_leave_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        write_json(dir.path(), "kiro-a.json", device_file(None, None)).await;
        let repo = Arc::new(FileRepository::new(Some(dir.path().to_path_buf())));

        let mut handles = Vec::new();
        for i in 0..20 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let cred = Credential::new("kiro-a.json", AuthMethod::Idc, format!("at_{i}"), "rt");
                repo.update(&cred).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let object = read_object(&dir.path().join("kiro-a.json")).await;
        let access = object["access_token"].as_str().unwrap();
        assert!(access.starts_with("at_"));
        assert_eq!(object["client_id"], "cid");
    }
}
