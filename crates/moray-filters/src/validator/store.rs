//! Credential stores backing Basic-Auth.
//!
//! A store maps usernames to bcrypt password hashes. The file store rereads
//! an htpasswd-style file with a short cache TTL; the cluster store is
//! seeded by a prefix scan and kept current by a background watcher.

use async_trait::async_trait;
use moray_core::{Cluster, KvSnapshot};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Source of `username -> bcrypt hash` credentials
#[async_trait]
pub trait CredentialStore: Send + Sync + fmt::Debug {
    /// Whether `password` matches the stored hash for `username`
    async fn matches(&self, username: &str, password: &str) -> bool;

    /// Serialized store contents, one `username:hash` line per entry,
    /// sorted by username
    async fn snapshot(&self) -> String;

    /// Stop background refresh, if any. Idempotent.
    fn close(&self);
}

fn verify(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

fn serialize_users(users: &HashMap<String, String>) -> String {
    let mut lines: Vec<String> = users
        .iter()
        .map(|(user, hash)| format!("{user}:{hash}"))
        .collect();
    lines.sort();
    lines.join("\n")
}

/// How long a loaded user file stays fresh. Removal of the file becomes
/// visible within this window without rereading per request.
const FILE_CACHE_TTL: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
struct FileCache {
    users: HashMap<String, String>,
    loaded_at: Option<Instant>,
}

/// Store reading an htpasswd-style file (`user:bcrypt_hash` per line).
///
/// Any malformed line makes the whole file count as empty, rejecting all
/// users. A missing file behaves the same way.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    ttl: Duration,
    cache: Mutex<FileCache>,
}

impl FileStore {
    /// Create a store over the given file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ttl: FILE_CACHE_TTL,
            cache: Mutex::new(FileCache::default()),
        }
    }

    fn parse(content: &str) -> HashMap<String, String> {
        let mut users = HashMap::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let Some((user, hash)) = line.split_once(':') else {
                warn!("malformed credential line, treating user file as empty");
                return HashMap::new();
            };
            users.insert(user.to_string(), hash.to_string());
        }
        users
    }

    async fn refresh_if_stale(&self) {
        let stale = {
            let cache = self.cache.lock();
            cache
                .loaded_at
                .map_or(true, |loaded| loaded.elapsed() > self.ttl)
        };
        if !stale {
            return;
        }

        let users = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot read user file");
                HashMap::new()
            }
        };

        let mut cache = self.cache.lock();
        cache.users = users;
        cache.loaded_at = Some(Instant::now());
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn matches(&self, username: &str, password: &str) -> bool {
        self.refresh_if_stale().await;
        let hash = match self.cache.lock().users.get(username) {
            Some(hash) => hash.clone(),
            None => return false,
        };
        verify(password, &hash)
    }

    async fn snapshot(&self) -> String {
        self.refresh_if_stale().await;
        serialize_users(&self.cache.lock().users)
    }

    fn close(&self) {}
}

/// Store seeded from the cluster KV under a prefix and refreshed by a
/// background watcher.
///
/// Each value under the prefix is a YAML document shaped either
/// `{username, password}` or `{key, password}`; anything else is silently
/// skipped. An empty prefix makes the store inert: no cluster calls,
/// every match fails.
pub struct ClusterStore {
    prefix: Option<String>,
    cluster: Option<Arc<dyn Cluster>>,
    users: Arc<RwLock<HashMap<String, String>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ClusterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterStore")
            .field("prefix", &self.prefix)
            .field("users", &self.users.read().len())
            .finish()
    }
}

/// Normalize a configured prefix to `/custom-data/<prefix>/`.
///
/// Leading and trailing slashes are absorbed, so the mapping is idempotent;
/// an effectively empty prefix yields `None` (inert store).
pub(crate) fn normalize_prefix(raw: &str) -> Option<String> {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    Some(format!("/custom-data/{trimmed}/"))
}

pub(crate) fn parse_credentials(kvs: &KvSnapshot) -> HashMap<String, String> {
    let mut users = HashMap::new();
    for value in kvs.values() {
        let Ok(doc) = serde_yaml::from_str::<serde_yaml::Value>(value) else {
            continue;
        };
        let Some(password) = doc.get("password").and_then(|v| v.as_str()) else {
            continue;
        };
        let username = doc
            .get("username")
            .and_then(|v| v.as_str())
            .or_else(|| doc.get("key").and_then(|v| v.as_str()));
        let Some(username) = username else {
            continue;
        };
        users.insert(username.to_string(), password.to_string());
    }
    users
}

impl ClusterStore {
    /// Create a store under the configured prefix.
    ///
    /// The store is inert when no cluster handle is supplied or the prefix
    /// normalizes to nothing.
    pub fn new(cluster: Option<Arc<dyn Cluster>>, raw_prefix: &str) -> Self {
        let prefix = normalize_prefix(raw_prefix).filter(|_| cluster.is_some());
        Self {
            prefix,
            cluster,
            users: Arc::new(RwLock::new(HashMap::new())),
            watcher: Mutex::new(None),
        }
    }

    /// The normalized prefix, `None` for an inert store
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Seed the in-memory map with a prefix scan.
    ///
    /// A failed scan leaves the store empty (fail closed) rather than
    /// aborting construction.
    pub async fn seed(&self) {
        let (Some(prefix), Some(cluster)) = (&self.prefix, &self.cluster) else {
            return;
        };
        match cluster.get_prefix(prefix).await {
            Ok(kvs) => {
                let users = parse_credentials(&kvs);
                debug!(prefix = %prefix, users = users.len(), "seeded credentials");
                *self.users.write() = users;
            }
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "credential seed failed");
            }
        }
    }

    /// Start the background watcher that swaps in each new snapshot
    pub async fn watch(&self) {
        let (Some(prefix), Some(cluster)) = (&self.prefix, &self.cluster) else {
            return;
        };
        let mut rx = match cluster.watch_prefix(prefix).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "credential watch failed to start");
                return;
            }
        };

        let users = Arc::clone(&self.users);
        let prefix = prefix.clone();
        let handle = tokio::spawn(async move {
            while let Some(kvs) = rx.recv().await {
                let parsed = parse_credentials(&kvs);
                debug!(prefix = %prefix, users = parsed.len(), "credentials updated");
                *users.write() = parsed;
            }
        });
        *self.watcher.lock() = Some(handle);
    }
}

#[async_trait]
impl CredentialStore for ClusterStore {
    async fn matches(&self, username: &str, password: &str) -> bool {
        if self.prefix.is_none() {
            return false;
        }
        let hash = match self.users.read().get(username) {
            Some(hash) => hash.clone(),
            None => return false,
        };
        verify(password, &hash)
    }

    async fn snapshot(&self) -> String {
        serialize_users(&self.users.read())
    }

    fn close(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(
            normalize_prefix("credentials/").as_deref(),
            Some("/custom-data/credentials/")
        );
        assert_eq!(
            normalize_prefix("/extra-slash/").as_deref(),
            Some("/custom-data/extra-slash/")
        );
        assert_eq!(
            normalize_prefix("creds/sub").as_deref(),
            Some("/custom-data/creds/sub/")
        );
        assert_eq!(normalize_prefix(""), None);
        assert_eq!(normalize_prefix("///"), None);
    }

    #[test]
    fn test_parse_credentials_shapes() {
        let mut kvs = KvSnapshot::new();
        kvs.insert("/creds/key1".into(), "key: key1\npass: pw".into());
        kvs.insert("/creds/key2".into(), "ky: key2\npassword: pw".into());
        kvs.insert("/creds/key3".into(), "key: key3\npassword: pw".into());

        let users = parse_credentials(&kvs);
        assert_eq!(serialize_users(&users), "key3:pw");
    }

    #[test]
    fn test_parse_credentials_prefers_username() {
        let mut kvs = KvSnapshot::new();
        kvs.insert(
            "/creds/1".into(),
            "username: alice\nkey: ignored\npassword: pw".into(),
        );
        let users = parse_credentials(&kvs);
        assert_eq!(users.get("alice").map(String::as_str), Some("pw"));
        assert!(!users.contains_key("ignored"));
    }

    #[test]
    fn test_parse_credentials_skips_extra_fields() {
        let mut kvs = KvSnapshot::new();
        kvs.insert(
            "/creds/doge".into(),
            "randomEntry1: 21\nnestedEntry:\n  key1: val1\npassword: doge\nkey: doge\nlastEntry: \"byebye\"\n".into(),
        );
        let users = parse_credentials(&kvs);
        assert_eq!(users.get("doge").map(String::as_str), Some("doge"));
    }

    #[test]
    fn test_file_parse_malformed_line_empties_file() {
        assert!(FileStore::parse("keypass").is_empty());
        assert_eq!(FileStore::parse("user:hash").len(), 1);
        assert!(FileStore::parse("user:hash\nbroken").is_empty());
    }

    #[tokio::test]
    async fn test_inert_store_rejects_everyone() {
        let store = ClusterStore::new(None, "credentials/");
        assert!(store.prefix().is_none());
        store.seed().await;
        store.watch().await;
        assert!(!store.matches("doge", "dogepw").await);
        store.close();
    }
}
