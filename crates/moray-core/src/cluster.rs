//! Cluster key-value abstraction.
//!
//! The gateway consumes a distributed KV store through this narrow
//! interface: a one-shot prefix scan for seeding, and a watch that delivers
//! full snapshots of the keys under a prefix whenever they change. The
//! production implementation is backed by etcd; tests use the in-process
//! [`mock::MockCluster`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;

/// A full snapshot of the keys under a watched prefix
pub type KvSnapshot = HashMap<String, String>;

/// Narrow view of the cluster KV store
#[async_trait]
pub trait Cluster: Send + Sync + fmt::Debug {
    /// All key-value pairs under `prefix`
    async fn get_prefix(&self, prefix: &str) -> Result<KvSnapshot>;

    /// Subscribe to `prefix`; the receiver yields a fresh snapshot whenever
    /// the keys under the prefix change. Dropping the receiver ends the
    /// subscription.
    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<KvSnapshot>>;
}

/// etcd-backed cluster implementation
pub mod etcd {
    use super::*;
    use etcd_client::{Client, GetOptions, WatchOptions};
    use tracing::warn;

    const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

    /// [`Cluster`] backed by an etcd cluster
    #[derive(Clone)]
    pub struct EtcdCluster {
        client: Client,
    }

    impl fmt::Debug for EtcdCluster {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("EtcdCluster").finish()
        }
    }

    impl EtcdCluster {
        /// Connect to the given etcd endpoints
        pub async fn connect(endpoints: Vec<String>) -> Result<Self> {
            let client = Client::connect(endpoints, None)
                .await
                .map_err(|e| Error::cluster(e.to_string()))?;
            Ok(Self { client })
        }

        async fn scan(client: &mut Client, prefix: &str) -> Result<KvSnapshot> {
            let resp = client
                .get(prefix, Some(GetOptions::new().with_prefix()))
                .await
                .map_err(|e| Error::cluster(e.to_string()))?;

            let mut snapshot = KvSnapshot::new();
            for kv in resp.kvs() {
                let key = kv
                    .key_str()
                    .map_err(|e| Error::cluster(e.to_string()))?
                    .to_string();
                let value = kv
                    .value_str()
                    .map_err(|e| Error::cluster(e.to_string()))?
                    .to_string();
                snapshot.insert(key, value);
            }
            Ok(snapshot)
        }
    }

    #[async_trait]
    impl Cluster for EtcdCluster {
        async fn get_prefix(&self, prefix: &str) -> Result<KvSnapshot> {
            let mut client = self.client.clone();
            Self::scan(&mut client, prefix).await
        }

        async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<KvSnapshot>> {
            let mut client = self.client.clone();
            let (watcher, mut stream) = client
                .watch(prefix, Some(WatchOptions::new().with_prefix()))
                .await
                .map_err(|e| Error::cluster(e.to_string()))?;

            let (tx, rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
            let prefix = prefix.to_string();
            tokio::spawn(async move {
                // The watcher must stay alive for the stream to keep
                // delivering events.
                let _watcher = watcher;
                loop {
                    match stream.message().await {
                        Ok(Some(_event)) => {
                            // etcd events carry deltas; re-scan so the
                            // subscriber always sees a full snapshot.
                            let snapshot = match Self::scan(&mut client, &prefix).await {
                                Ok(s) => s,
                                Err(e) => {
                                    warn!(prefix = %prefix, error = %e, "prefix re-scan failed");
                                    continue;
                                }
                            };
                            if tx.send(snapshot).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(prefix = %prefix, error = %e, "watch stream failed");
                            break;
                        }
                    }
                }
            });
            Ok(rx)
        }
    }
}

/// In-process cluster used by tests
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// [`Cluster`] whose contents and snapshot stream are driven by the test
    #[derive(Debug, Clone, Default)]
    pub struct MockCluster {
        data: Arc<Mutex<KvSnapshot>>,
        watchers: Arc<Mutex<Vec<mpsc::Sender<KvSnapshot>>>>,
    }

    impl MockCluster {
        /// Create an empty mock cluster
        pub fn new() -> Self {
            Self::default()
        }

        /// Replace the stored key-value pairs served by `get_prefix`
        pub fn seed(&self, kvs: KvSnapshot) {
            *self.data.lock() = kvs;
        }

        /// Store one key-value pair
        pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
            self.data.lock().insert(key.into(), value.into());
        }

        /// Deliver a snapshot to every active watcher
        pub async fn publish(&self, snapshot: KvSnapshot) {
            let senders = self.watchers.lock().clone();
            for tx in senders {
                let _ = tx.send(snapshot.clone()).await;
            }
        }
    }

    #[async_trait]
    impl Cluster for MockCluster {
        async fn get_prefix(&self, prefix: &str) -> Result<KvSnapshot> {
            Ok(self
                .data
                .lock()
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }

        async fn watch_prefix(&self, _prefix: &str) -> Result<mpsc::Receiver<KvSnapshot>> {
            let (tx, rx) = mpsc::channel(16);
            self.watchers.lock().push(tx);
            Ok(rx)
        }
    }

}
