//! Credential-validating filter.
//!
//! Composes independent sub-validators, each enabled by the presence of its
//! spec section. A request is rejected (result `invalid`) as soon as any
//! enabled sub-validator rejects it.

mod basic_auth;
mod headers;
mod jwt;
mod oauth2;
mod signature;
pub mod store;

pub use basic_auth::{BasicAuthMode, BasicAuthSpec};
pub use headers::HeaderRule;
pub use jwt::JwtSpec;
pub use oauth2::{OAuth2Spec, TokenIntrospectSpec};
pub use signature::{sign, SignatureSpec, HEADER_SIGN_DATE, SCHEME};

use async_trait::async_trait;
use basic_auth::BasicAuthValidator;
use futures::future::BoxFuture;
use headers::HeadersValidator;
use jwt::JwtValidator;
use moray_core::{ConstructArgs, Filter, FilterRecord, RequestContext, Result};
use oauth2::OAuth2Validator;
use serde::{Deserialize, Serialize};
use signature::SignatureValidator;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Kind identifier of the validator filter
pub const KIND: &str = "Validator";

/// The only result label the validator returns
pub const RESULT_INVALID: &str = "invalid";

/// Request header set to the authenticated username on Basic-Auth accept
pub const HEADER_AUTH_USER: &str = "X-AUTH-USER";

/// Spec of the validator filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorSpec {
    /// Filter name
    pub name: String,
    /// Filter kind
    pub kind: String,

    /// Per-header allowlist/regexp rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, HeaderRule>>,

    /// JWT verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<JwtSpec>,

    /// OAuth2 verification (self-encoded JWT or token introspection)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth2: Option<OAuth2Spec>,

    /// HMAC signature verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureSpec>,

    /// Basic-Auth against a credential store
    #[serde(
        default,
        rename = "basicAuth",
        skip_serializing_if = "Option::is_none"
    )]
    pub basic_auth: Option<BasicAuthSpec>,
}

/// Filter that authenticates requests; declared result labels: `invalid`
#[derive(Debug)]
pub struct ValidatorFilter {
    headers: Option<HeadersValidator>,
    jwt: Option<JwtValidator>,
    oauth2: Option<OAuth2Validator>,
    signature: Option<SignatureValidator>,
    basic_auth: Option<BasicAuthValidator>,

    total: AtomicU64,
    rejected: AtomicU64,
}

/// Registry record of the validator kind
pub fn record() -> FilterRecord {
    FilterRecord {
        kind: KIND,
        results: &[RESULT_INVALID],
        default_spec,
        validate: validate_spec,
        construct,
    }
}

fn default_spec() -> serde_yaml::Value {
    serde_yaml::to_value(ValidatorSpec {
        kind: KIND.to_string(),
        ..ValidatorSpec::default()
    })
    .unwrap_or(serde_yaml::Value::Null)
}

fn validate_spec(doc: &serde_yaml::Value) -> Result<()> {
    let spec: ValidatorSpec = serde_yaml::from_value(doc.clone())?;
    if let Some(rules) = &spec.headers {
        headers::check_rules(rules)?;
    }
    if let Some(jwt) = &spec.jwt {
        jwt::check_spec(jwt)?;
    }
    if let Some(oauth2) = &spec.oauth2 {
        oauth2::check_spec(oauth2)?;
    }
    if let Some(basic_auth) = &spec.basic_auth {
        basic_auth::check_spec(basic_auth)?;
    }
    Ok(())
}

fn construct(args: ConstructArgs<'_>) -> BoxFuture<'_, Result<Arc<dyn Filter>>> {
    Box::pin(async move {
        // Reload with a retained name: adopt the predecessor wholesale so
        // warmed credential caches and open watchers carry over.
        if let Some(previous) = args.previous {
            return Ok(previous);
        }
        let spec: ValidatorSpec = serde_yaml::from_value(args.spec.clone())?;
        let filter = ValidatorFilter::new(spec, args.deps.cluster.clone()).await?;
        Ok(Arc::new(filter) as Arc<dyn Filter>)
    })
}

impl ValidatorFilter {
    /// Build a validator from its spec.
    ///
    /// `cluster` is required only when the spec enables Basic-Auth in ETCD
    /// mode; without it the credential store is inert and rejects everyone.
    pub async fn new(
        spec: ValidatorSpec,
        cluster: Option<Arc<dyn moray_core::Cluster>>,
    ) -> Result<Self> {
        let headers = spec.headers.map(HeadersValidator::new).transpose()?;
        let jwt = spec.jwt.map(JwtValidator::new).transpose()?;
        let oauth2 = spec.oauth2.map(OAuth2Validator::new).transpose()?;
        let signature = spec.signature.map(SignatureValidator::new);
        let basic_auth = match spec.basic_auth {
            Some(ba) => Some(BasicAuthValidator::new(ba, cluster).await?),
            None => None,
        };

        Ok(Self {
            headers,
            jwt,
            oauth2,
            signature,
            basic_auth,
            total: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Serialized contents of the Basic-Auth credential store, one
    /// `username:hash` line per entry. `None` when Basic-Auth is not
    /// enabled.
    pub async fn credential_snapshot(&self) -> Option<String> {
        match &self.basic_auth {
            Some(basic_auth) => Some(basic_auth.store().snapshot().await),
            None => None,
        }
    }

    async fn accepts(&self, ctx: &mut RequestContext) -> bool {
        if let Some(headers) = &self.headers {
            if !headers.validate(ctx) {
                return false;
            }
        }
        if let Some(jwt) = &self.jwt {
            if jwt.validate(ctx).is_none() {
                return false;
            }
        }
        if let Some(oauth2) = &self.oauth2 {
            if !oauth2.validate(ctx).await {
                return false;
            }
        }
        if let Some(signature) = &self.signature {
            if !signature.validate(ctx) {
                return false;
            }
        }
        if let Some(basic_auth) = &self.basic_auth {
            match basic_auth.validate(ctx).await {
                Some(username) => ctx.set_header(HEADER_AUTH_USER, &username),
                None => return false,
            }
        }
        true
    }
}

#[async_trait]
impl Filter for ValidatorFilter {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn handle(&self, ctx: &mut RequestContext) -> Option<String> {
        self.total.fetch_add(1, Ordering::Relaxed);
        if self.accepts(ctx).await {
            None
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            Some(RESULT_INVALID.to_string())
        }
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "totalRequests": self.total.load(Ordering::Relaxed),
            "rejected": self.rejected.load(Ordering::Relaxed),
        })
    }

    fn close(&self) {
        if let Some(basic_auth) = &self.basic_auth {
            basic_auth.close();
        }
    }
}
