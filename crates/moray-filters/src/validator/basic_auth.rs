//! Basic-Auth sub-validator

use super::store::{ClusterStore, CredentialStore, FileStore};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use moray_core::{Cluster, Error, RequestContext, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const BASIC_PREFIX: &str = "Basic ";

/// Where Basic-Auth credentials come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BasicAuthMode {
    /// htpasswd-style local file
    #[serde(rename = "FILE")]
    File,
    /// Cluster KV store under a prefix
    #[serde(rename = "ETCD")]
    Etcd,
}

/// Basic-Auth spec
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BasicAuthSpec {
    /// Credential source
    pub mode: BasicAuthMode,

    /// Credential file path, required in FILE mode
    #[serde(default, rename = "userFile", skip_serializing_if = "Option::is_none")]
    pub user_file: Option<String>,

    /// Cluster KV prefix, ETCD mode; empty yields an inert store
    #[serde(
        default,
        rename = "etcdPrefix",
        skip_serializing_if = "Option::is_none"
    )]
    pub etcd_prefix: Option<String>,
}

pub(super) fn check_spec(spec: &BasicAuthSpec) -> Result<()> {
    if spec.mode == BasicAuthMode::File && spec.user_file.is_none() {
        return Err(Error::Spec("basicAuth FILE mode requires userFile".into()));
    }
    Ok(())
}

/// Authenticates `Authorization: Basic <base64>` against a credential store
#[derive(Debug)]
pub(super) struct BasicAuthValidator {
    store: Arc<dyn CredentialStore>,
}

impl BasicAuthValidator {
    pub(super) async fn new(
        spec: BasicAuthSpec,
        cluster: Option<Arc<dyn Cluster>>,
    ) -> Result<Self> {
        check_spec(&spec)?;
        let store: Arc<dyn CredentialStore> = match spec.mode {
            BasicAuthMode::File => {
                let path = spec
                    .user_file
                    .ok_or_else(|| Error::Spec("basicAuth FILE mode requires userFile".into()))?;
                Arc::new(FileStore::new(path))
            }
            BasicAuthMode::Etcd => {
                let store =
                    ClusterStore::new(cluster, spec.etcd_prefix.as_deref().unwrap_or_default());
                store.seed().await;
                store.watch().await;
                Arc::new(store)
            }
        };
        Ok(Self { store })
    }

    /// Returns the authenticated username, or `None` on rejection
    pub(super) async fn validate(&self, ctx: &RequestContext) -> Option<String> {
        let auth = ctx.header(http::header::AUTHORIZATION.as_str())?;
        let encoded = auth.strip_prefix(BASIC_PREFIX)?;
        let decoded = BASE64.decode(encoded).ok()?;
        let credentials = String::from_utf8(decoded).ok()?;
        let (username, password) = credentials.split_once(':')?;

        if self.store.matches(username, password).await {
            Some(username.to_string())
        } else {
            None
        }
    }

    /// The backing store, for introspection
    pub(super) fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub(super) fn close(&self) {
        self.store.close();
    }
}
