//! Integration tests for pipeline validation, execution, and inheritance

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use http_body_util::Full;
use moray_core::{
    ConstructArgs, Error, Filter, FilterDeps, FilterRecord, FilterRegistry, RequestContext,
    Result,
};
use moray_pipeline::{validate, Pipeline, PipelineMap, PipelineSpec, SpecError};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

static CLOSE_COUNTS: Lazy<Mutex<HashMap<String, usize>>> = Lazy::new(Mutex::default);

fn close_count(name: &str) -> usize {
    CLOSE_COUNTS.lock().get(name).copied().unwrap_or(0)
}

#[derive(Debug, Deserialize)]
struct MockSpec {
    name: String,
    #[allow(dead_code)]
    kind: String,
    #[serde(default)]
    result: Option<String>,
}

/// Filter that returns the label fixed in its spec
#[derive(Debug)]
struct MockFilter {
    kind: &'static str,
    name: String,
    result: Option<String>,
}

#[async_trait]
impl Filter for MockFilter {
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn handle(&self, _ctx: &mut RequestContext) -> Option<String> {
        self.result.clone()
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({ "name": self.name })
    }

    fn close(&self) {
        *CLOSE_COUNTS.lock().entry(self.name.clone()).or_insert(0) += 1;
    }
}

fn mock_record(kind: &'static str) -> FilterRecord {
    fn default_spec() -> serde_yaml::Value {
        serde_yaml::Value::Null
    }
    fn validate_spec(doc: &serde_yaml::Value) -> Result<()> {
        serde_yaml::from_value::<MockSpec>(doc.clone())?;
        Ok(())
    }
    fn construct_mock(args: ConstructArgs<'_>) -> BoxFuture<'_, Result<Arc<dyn Filter>>> {
        construct(args, "Mock")
    }
    fn construct_probe(args: ConstructArgs<'_>) -> BoxFuture<'_, Result<Arc<dyn Filter>>> {
        construct(args, "Probe")
    }
    fn construct<'a>(
        args: ConstructArgs<'a>,
        kind: &'static str,
    ) -> BoxFuture<'a, Result<Arc<dyn Filter>>> {
        Box::pin(async move {
            if let Some(previous) = args.previous {
                return Ok(previous);
            }
            let spec: MockSpec = serde_yaml::from_value(args.spec.clone())?;
            if spec.name == "reject-construct" {
                return Err(Error::Spec("constructor rejects this name".into()));
            }
            Ok(Arc::new(MockFilter {
                kind,
                name: spec.name,
                result: spec.result,
            }) as Arc<dyn Filter>)
        })
    }

    FilterRecord {
        kind,
        results: &["deny", "mark"],
        default_spec,
        validate: validate_spec,
        construct: if kind == "Mock" {
            construct_mock
        } else {
            construct_probe
        },
    }
}

fn registry() -> FilterRegistry {
    let mut registry = FilterRegistry::new();
    registry.register(mock_record("Mock")).unwrap();
    registry.register(mock_record("Probe")).unwrap();
    registry
}

fn handlers() -> PipelineMap {
    Arc::new(DashMap::new())
}

async fn build(
    yaml: &str,
    previous: Option<&Pipeline>,
    registry: &FilterRegistry,
    handlers: PipelineMap,
) -> Result<Arc<Pipeline>> {
    let spec = PipelineSpec::from_yaml(yaml).map_err(|e| Error::Spec(e.to_string()))?;
    Pipeline::new(spec, previous, registry, &FilterDeps::default(), handlers).await
}

fn request_ctx() -> RequestContext {
    let req = http::Request::builder()
        .uri("http://example.com/")
        .body(Full::new(Bytes::new()))
        .unwrap();
    RequestContext::new(req)
}

fn stats_of(ctx: &RequestContext) -> String {
    ctx.tags().first().cloned().unwrap_or_default()
}

mod validation {
    use super::*;

    fn check(yaml: &str) -> std::result::Result<(), SpecError> {
        let spec = PipelineSpec::from_yaml(yaml)?;
        validate(&spec, &registry())
    }

    #[test]
    fn test_valid_spec_passes() {
        let yaml = r#"
kind: HTTPPipeline
name: api
flow:
  - filter: one
    jumpIf:
      deny: END
  - filter: two
filters:
  - name: one
    kind: Mock
  - name: two
    kind: Mock
"#;
        check(yaml).unwrap();
    }

    #[test]
    fn test_wrong_pipeline_kind() {
        let yaml = "kind: TCPPipeline\nname: api\nfilters:\n  - name: one\n    kind: Mock";
        assert!(matches!(check(yaml), Err(SpecError::WrongKind(_))));
    }

    #[test]
    fn test_filter_named_end_is_reserved() {
        let yaml = "kind: HTTPPipeline\nname: api\nfilters:\n  - name: END\n    kind: Mock";
        assert!(matches!(check(yaml), Err(SpecError::ReservedName)));
    }

    #[test]
    fn test_missing_filter_name() {
        let yaml = "kind: HTTPPipeline\nname: api\nfilters:\n  - kind: Mock";
        assert!(matches!(check(yaml), Err(SpecError::MetaMissingName)));
    }

    #[test]
    fn test_missing_filter_kind() {
        let yaml = "kind: HTTPPipeline\nname: api\nfilters:\n  - name: one";
        assert!(matches!(check(yaml), Err(SpecError::MetaMissingKind)));
    }

    #[test]
    fn test_duplicate_filter_name() {
        let yaml = r#"
kind: HTTPPipeline
name: api
filters:
  - name: one
    kind: Mock
  - name: one
    kind: Mock
"#;
        assert!(matches!(check(yaml), Err(SpecError::DuplicateName(n)) if n == "one"));
    }

    #[test]
    fn test_unknown_kind() {
        let yaml = "kind: HTTPPipeline\nname: api\nfilters:\n  - name: one\n    kind: Nope";
        assert!(matches!(check(yaml), Err(SpecError::UnknownKind(k)) if k == "Nope"));
    }

    #[test]
    fn test_no_filters() {
        let yaml = "kind: HTTPPipeline\nname: api\nfilters: []";
        assert!(matches!(check(yaml), Err(SpecError::NoFilters)));
    }

    #[test]
    fn test_flow_references_unknown_filter() {
        let yaml = r#"
kind: HTTPPipeline
name: api
flow:
  - filter: ghost
filters:
  - name: one
    kind: Mock
"#;
        assert!(matches!(check(yaml), Err(SpecError::FlowUnknownFilter(f)) if f == "ghost"));
    }

    #[test]
    fn test_flow_repeats_filter() {
        let yaml = r#"
kind: HTTPPipeline
name: api
flow:
  - filter: one
  - filter: one
filters:
  - name: one
    kind: Mock
"#;
        assert!(matches!(check(yaml), Err(SpecError::FlowRepeatedFilter(_))));
    }

    #[test]
    fn test_jump_on_undeclared_result() {
        let yaml = r#"
kind: HTTPPipeline
name: api
flow:
  - filter: one
    jumpIf:
      nosuch: END
filters:
  - name: one
    kind: Mock
"#;
        assert!(matches!(
            check(yaml),
            Err(SpecError::UnknownResult { result, .. }) if result == "nosuch"
        ));
    }

    #[test]
    fn test_backward_jump_rejected() {
        let yaml = r#"
kind: HTTPPipeline
name: api
flow:
  - filter: one
  - filter: two
    jumpIf:
      deny: one
filters:
  - name: one
    kind: Mock
  - name: two
    kind: Mock
"#;
        assert!(matches!(
            check(yaml),
            Err(SpecError::InvalidJumpTarget { target, .. }) if target == "one"
        ));
    }

    #[test]
    fn test_self_jump_rejected() {
        let yaml = r#"
kind: HTTPPipeline
name: api
flow:
  - filter: one
    jumpIf:
      deny: one
filters:
  - name: one
    kind: Mock
"#;
        assert!(matches!(
            check(yaml),
            Err(SpecError::InvalidJumpTarget { .. })
        ));
    }

    #[tokio::test]
    async fn test_validate_and_construct_agree() {
        let valid = r#"
kind: HTTPPipeline
name: api
filters:
  - name: one
    kind: Mock
"#;
        let invalid = "kind: HTTPPipeline\nname: api\nfilters:\n  - name: one\n    kind: Nope";

        let registry = registry();
        assert!(check(valid).is_ok());
        assert!(build(valid, None, &registry, handlers()).await.is_ok());
        assert!(check(invalid).is_err());
        assert!(build(invalid, None, &registry, handlers()).await.is_err());
    }

    #[tokio::test]
    async fn test_constructor_rejection_aborts_build() {
        // Passes validation but the constructor refuses the spec.
        let yaml = r#"
kind: HTTPPipeline
name: api
filters:
  - name: reject-construct
    kind: Mock
"#;
        let registry = registry();
        let err = build(yaml, None, &registry, handlers()).await.unwrap_err();
        assert!(matches!(err, Error::Construct { .. }));
    }
}

mod execution {
    use super::*;

    #[tokio::test]
    async fn test_declaration_order_without_flow() {
        let yaml = r#"
kind: HTTPPipeline
name: plain
filters:
  - name: first
    kind: Mock
  - name: second
    kind: Mock
  - name: third
    kind: Mock
"#;
        let registry = registry();
        let pipeline = build(yaml, None, &registry, handlers()).await.unwrap();

        let mut ctx = request_ctx();
        pipeline.handle(&mut ctx).await;

        let tag = stats_of(&ctx);
        assert!(tag.starts_with("pipeline: first("), "tag: {tag}");
        let first = tag.find("first(").unwrap();
        let second = tag.find("second(").unwrap();
        let third = tag.find("third(").unwrap();
        assert!(first < second && second < third);
    }

    #[tokio::test]
    async fn test_label_without_jump_table_stops() {
        let yaml = r#"
kind: HTTPPipeline
name: stop
filters:
  - name: gate
    kind: Mock
    result: deny
  - name: after
    kind: Mock
"#;
        let registry = registry();
        let pipeline = build(yaml, None, &registry, handlers()).await.unwrap();

        let mut ctx = request_ctx();
        pipeline.handle(&mut ctx).await;

        let tag = stats_of(&ctx);
        assert!(tag.contains("gate(deny,"), "tag: {tag}");
        assert!(!tag.contains("after("), "tag: {tag}");
    }

    #[tokio::test]
    async fn test_jump_skips_to_target() {
        let yaml = r#"
kind: HTTPPipeline
name: jump
flow:
  - filter: gate
    jumpIf:
      deny: last
  - filter: skipped
  - filter: last
filters:
  - name: gate
    kind: Mock
    result: deny
  - name: skipped
    kind: Mock
  - name: last
    kind: Mock
"#;
        let registry = registry();
        let pipeline = build(yaml, None, &registry, handlers()).await.unwrap();

        let mut ctx = request_ctx();
        pipeline.handle(&mut ctx).await;

        let tag = stats_of(&ctx);
        assert!(tag.contains("gate(deny,"), "tag: {tag}");
        assert!(tag.contains("last("), "tag: {tag}");
        assert!(!tag.contains("skipped("), "tag: {tag}");
    }

    #[tokio::test]
    async fn test_jump_to_end_terminates() {
        let yaml = r#"
kind: HTTPPipeline
name: jump-end
flow:
  - filter: gate
    jumpIf:
      deny: END
  - filter: after
filters:
  - name: gate
    kind: Mock
    result: deny
  - name: after
    kind: Mock
"#;
        let registry = registry();
        let pipeline = build(yaml, None, &registry, handlers()).await.unwrap();

        let mut ctx = request_ctx();
        pipeline.handle(&mut ctx).await;

        let tag = stats_of(&ctx);
        assert!(tag.contains("gate(deny,"), "tag: {tag}");
        assert!(!tag.contains("after("), "tag: {tag}");
    }

    #[tokio::test]
    async fn test_undeclared_label_terminates() {
        let yaml = r#"
kind: HTTPPipeline
name: buggy
filters:
  - name: rogue
    kind: Mock
    result: bogus
  - name: after
    kind: Mock
"#;
        let registry = registry();
        let pipeline = build(yaml, None, &registry, handlers()).await.unwrap();

        let mut ctx = request_ctx();
        pipeline.handle(&mut ctx).await;

        let tag = stats_of(&ctx);
        assert!(tag.contains("rogue(bogus,"), "tag: {tag}");
        assert!(!tag.contains("after("), "tag: {tag}");
    }

    #[tokio::test]
    async fn test_unreachable_filters_are_constructed() {
        let yaml = r#"
kind: HTTPPipeline
name: staged
flow:
  - filter: live
filters:
  - name: live
    kind: Mock
  - name: staged-only
    kind: Mock
"#;
        let registry = registry();
        let pipeline = build(yaml, None, &registry, handlers()).await.unwrap();

        // Declared-but-unflowed filters are constructed, never walked.
        assert!(pipeline.filter_instance("live").is_some());
        assert!(pipeline.filter_instance("staged-only").is_some());

        let mut ctx = request_ctx();
        pipeline.handle(&mut ctx).await;
        let tag = stats_of(&ctx);
        assert!(tag.contains("live("), "tag: {tag}");
        assert!(!tag.contains("staged-only("), "tag: {tag}");
    }

    #[tokio::test]
    async fn test_status_aggregates_filters() {
        let yaml = r#"
kind: HTTPPipeline
name: stat
filters:
  - name: one
    kind: Mock
  - name: two
    kind: Probe
"#;
        let registry = registry();
        let pipeline = build(yaml, None, &registry, handlers()).await.unwrap();

        let status = pipeline.status();
        assert!(status.timestamp > 0);
        assert_eq!(status.filters.len(), 2);
        assert!(status.filters.contains_key("one"));
        assert!(status.filters.contains_key("two"));
    }
}

mod reload {
    use super::*;

    const V1: &str = r#"
kind: HTTPPipeline
name: api
filters:
  - name: keep
    kind: Mock
  - name: drop-me
    kind: Mock
"#;

    const V2: &str = r#"
kind: HTTPPipeline
name: api
filters:
  - name: keep
    kind: Mock
  - name: fresh
    kind: Mock
"#;

    #[tokio::test]
    async fn test_retained_filter_is_the_same_instance() {
        let registry = registry();
        let handlers = handlers();

        let p1 = build(V1, None, &registry, Arc::clone(&handlers))
            .await
            .unwrap();
        let p2 = build(V2, Some(&p1), &registry, Arc::clone(&handlers))
            .await
            .unwrap();

        let kept_before = p1.filter_instance("keep").unwrap();
        let kept_after = p2.filter_instance("keep").unwrap();
        assert!(Arc::ptr_eq(&kept_before, &kept_after));
        assert!(p2.filter_instance("fresh").is_some());
        assert!(p2.filter_instance("drop-me").is_none());
    }

    #[tokio::test]
    async fn test_dropped_filter_closed_exactly_once() {
        let registry = registry();
        let handlers = handlers();

        let p1 = build(
            &V1.replace("drop-me", "drop-once"),
            None,
            &registry,
            Arc::clone(&handlers),
        )
        .await
        .unwrap();
        assert_eq!(close_count("drop-once"), 0);

        let _p2 = build(
            &V2.replace("keep", "keep-b"),
            Some(&p1),
            &registry,
            Arc::clone(&handlers),
        )
        .await
        .unwrap();

        assert_eq!(close_count("drop-once"), 1);
    }

    #[tokio::test]
    async fn test_kind_change_constructs_fresh_and_closes_old() {
        let registry = registry();
        let handlers = handlers();

        let v1 = r#"
kind: HTTPPipeline
name: kindswap
filters:
  - name: swapped
    kind: Mock
"#;
        let v2 = r#"
kind: HTTPPipeline
name: kindswap
filters:
  - name: swapped
    kind: Probe
"#;
        let p1 = build(v1, None, &registry, Arc::clone(&handlers))
            .await
            .unwrap();
        let old = p1.filter_instance("swapped").unwrap();

        let p2 = build(v2, Some(&p1), &registry, Arc::clone(&handlers))
            .await
            .unwrap();
        let new = p2.filter_instance("swapped").unwrap();

        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.kind(), "Probe");
        assert_eq!(close_count("swapped"), 1);
    }

    #[tokio::test]
    async fn test_handler_map_replacement_and_close() {
        let registry = registry();
        let handlers = handlers();

        let p1 = build(
            &V1.replace("api", "mapped"),
            None,
            &registry,
            Arc::clone(&handlers),
        )
        .await
        .unwrap();
        assert!(Arc::ptr_eq(handlers.get("mapped").unwrap().value(), &p1));

        let p2 = build(
            &V2.replace("api", "mapped"),
            Some(&p1),
            &registry,
            Arc::clone(&handlers),
        )
        .await
        .unwrap();
        assert!(Arc::ptr_eq(handlers.get("mapped").unwrap().value(), &p2));

        p2.close();
        assert!(handlers.get("mapped").is_none());
    }
}
