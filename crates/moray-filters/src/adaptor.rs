//! Request path adaptation filter

use async_trait::async_trait;
use futures::future::BoxFuture;
use moray_core::{
    ConstructArgs, Error, Filter, FilterRecord, RequestContext, Result,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Kind identifier of the request adaptor filter
pub const KIND: &str = "RequestAdaptor";

/// Spec of the request adaptor filter.
///
/// Rules apply in precedence order: `replace`, `addPrefix`, `trimPrefix`,
/// `regexpReplace`; the first configured rule wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdaptorSpec {
    /// Filter name
    pub name: String,
    /// Filter kind
    pub kind: String,

    /// Replace the whole path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<String>,

    /// Prepend a prefix to the path
    #[serde(default, rename = "addPrefix", skip_serializing_if = "Option::is_none")]
    pub add_prefix: Option<String>,

    /// Strip a prefix from the path, when present
    #[serde(default, rename = "trimPrefix", skip_serializing_if = "Option::is_none")]
    pub trim_prefix: Option<String>,

    /// Regexp-replace pair applied to the whole path
    #[serde(
        default,
        rename = "regexpReplace",
        skip_serializing_if = "Option::is_none"
    )]
    pub regexp_replace: Option<RegexpReplace>,
}

/// Regexp-replace rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegexpReplace {
    /// Pattern matched against the request path
    pub regexp: String,
    /// Replacement, `$1`-style capture references allowed
    pub replace: String,
}

/// Filter that rewrites the request path according to its spec
#[derive(Debug)]
pub struct RequestAdaptor {
    spec: AdaptorSpec,
    regexp: Option<Regex>,
    adapted: AtomicU64,
}

/// Registry record of the request adaptor kind
pub fn record() -> FilterRecord {
    FilterRecord {
        kind: KIND,
        results: &[],
        default_spec,
        validate: validate_spec,
        construct,
    }
}

fn default_spec() -> serde_yaml::Value {
    serde_yaml::to_value(AdaptorSpec {
        kind: KIND.to_string(),
        ..AdaptorSpec::default()
    })
    .unwrap_or(serde_yaml::Value::Null)
}

fn validate_spec(doc: &serde_yaml::Value) -> Result<()> {
    let spec: AdaptorSpec = serde_yaml::from_value(doc.clone())?;
    if let Some(rr) = &spec.regexp_replace {
        Regex::new(&rr.regexp).map_err(|e| Error::Spec(format!("invalid regexp: {e}")))?;
    }
    Ok(())
}

fn construct(args: ConstructArgs<'_>) -> BoxFuture<'_, Result<Arc<dyn Filter>>> {
    Box::pin(async move {
        if let Some(previous) = args.previous {
            return Ok(previous);
        }
        let spec: AdaptorSpec = serde_yaml::from_value(args.spec.clone())?;
        Ok(Arc::new(RequestAdaptor::new(spec)?) as Arc<dyn Filter>)
    })
}

impl RequestAdaptor {
    /// Build an adaptor from its spec
    pub fn new(spec: AdaptorSpec) -> Result<Self> {
        let regexp = match &spec.regexp_replace {
            Some(rr) => Some(
                Regex::new(&rr.regexp)
                    .map_err(|e| Error::Spec(format!("invalid regexp: {e}")))?,
            ),
            None => None,
        };
        Ok(Self {
            spec,
            regexp,
            adapted: AtomicU64::new(0),
        })
    }

    fn adapt(&self, path: &str) -> String {
        if let Some(replace) = &self.spec.replace {
            return replace.clone();
        }
        if let Some(prefix) = &self.spec.add_prefix {
            return format!("{prefix}{path}");
        }
        if let Some(prefix) = &self.spec.trim_prefix {
            return path.strip_prefix(prefix.as_str()).unwrap_or(path).to_string();
        }
        if let (Some(rr), Some(re)) = (&self.spec.regexp_replace, &self.regexp) {
            return re.replace_all(path, rr.replace.as_str()).into_owned();
        }
        path.to_string()
    }
}

#[async_trait]
impl Filter for RequestAdaptor {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn handle(&self, ctx: &mut RequestContext) -> Option<String> {
        let adapted = self.adapt(ctx.path());
        if adapted != ctx.path() {
            ctx.set_path(&adapted);
            self.adapted.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "adaptedRequests": self.adapted.load(Ordering::Relaxed),
        })
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adaptor(yaml: &str) -> RequestAdaptor {
        let doc: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        validate_spec(&doc).unwrap();
        RequestAdaptor::new(serde_yaml::from_value(doc).unwrap()).unwrap()
    }

    #[test]
    fn test_replace_wins_over_other_rules() {
        let a = adaptor(
            "name: rewrite\nkind: RequestAdaptor\nreplace: /fixed\naddPrefix: /v1",
        );
        assert_eq!(a.adapt("/anything"), "/fixed");
    }

    #[test]
    fn test_add_prefix() {
        let a = adaptor("name: rewrite\nkind: RequestAdaptor\naddPrefix: /v1");
        assert_eq!(a.adapt("/users"), "/v1/users");
    }

    #[test]
    fn test_trim_prefix() {
        let a = adaptor("name: rewrite\nkind: RequestAdaptor\ntrimPrefix: /v1");
        assert_eq!(a.adapt("/v1/users"), "/users");
        assert_eq!(a.adapt("/v2/users"), "/v2/users");
    }

    #[test]
    fn test_regexp_replace() {
        let a = adaptor(
            "name: rewrite\nkind: RequestAdaptor\nregexpReplace:\n  regexp: \"^/api/(.*)$\"\n  replace: \"/$1\"",
        );
        assert_eq!(a.adapt("/api/users"), "/users");
    }

    #[test]
    fn test_invalid_regexp_rejected_by_validate() {
        let doc: serde_yaml::Value = serde_yaml::from_str(
            "name: rewrite\nkind: RequestAdaptor\nregexpReplace:\n  regexp: \"[\"\n  replace: \"/\"",
        )
        .unwrap();
        assert!(validate_spec(&doc).is_err());
    }

    #[test]
    fn test_unknown_field_rejected_by_validate() {
        let doc: serde_yaml::Value =
            serde_yaml::from_str("name: rewrite\nkind: RequestAdaptor\nbogus: 1").unwrap();
        assert!(validate_spec(&doc).is_err());
    }
}
