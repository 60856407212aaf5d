//! Runtime compiled form of a pipeline spec

use crate::context::{delete_pipeline_context, new_pipeline_context, FilterStat};
use crate::spec::{meta_of, FlowStep, PipelineSpec};
use crate::validate::{validate, SpecError};
use dashmap::DashMap;
use moray_core::{
    ConstructArgs, Error, Filter, FilterDeps, FilterMeta, FilterRecord, FilterRegistry,
    RequestContext, Result, LABEL_END,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Shared `pipeline name -> Pipeline` map read on dispatch and written only
/// on reload
pub type PipelineMap = Arc<DashMap<String, Arc<Pipeline>>>;

/// A materialized filter paired with its flow position
#[derive(Debug)]
struct RunningFilter {
    meta: FilterMeta,
    jump_if: HashMap<String, String>,
    record: FilterRecord,
    instance: Arc<dyn Filter>,
}

/// Status document generated at runtime
#[derive(Debug, Serialize)]
pub struct PipelineStatus {
    /// Unix timestamp of the snapshot
    pub timestamp: i64,
    /// Per-filter status documents keyed by filter name
    pub filters: HashMap<String, serde_json::Value>,
}

/// Runtime compiled form of a [`PipelineSpec`]: materialized filter
/// instances plus the flow.
///
/// Requests are dispatched through [`Pipeline::handle`] from arbitrarily
/// many request tasks concurrently.
#[derive(Debug)]
pub struct Pipeline {
    spec: PipelineSpec,
    running: Vec<RunningFilter>,
    // Declared but absent from a non-empty flow: constructed and closed
    // with the pipeline, never walked. Permits staged rollout of a filter
    // before wiring it into the flow.
    standby: Vec<RunningFilter>,
    handlers: PipelineMap,
}

impl Pipeline {
    /// Compile a spec into a pipeline and install it in `handlers`.
    ///
    /// When `previous` is supplied, filters whose name and kind match a
    /// predecessor filter adopt that instance, carrying its long-lived
    /// state (warmed caches, open watchers) across the reload. Predecessor
    /// filters with no counterpart in the new pipeline are closed after the
    /// new set is materialized, so in-flight requests against them complete
    /// naturally.
    pub async fn new(
        spec: PipelineSpec,
        previous: Option<&Pipeline>,
        registry: &FilterRegistry,
        deps: &FilterDeps,
        handlers: PipelineMap,
    ) -> Result<Arc<Self>> {
        validate(&spec, registry).map_err(|e| Error::Spec(e.to_string()))?;

        let ordered = resolve_order(&spec)?;

        let mut running = Vec::new();
        let mut standby = Vec::new();
        for (doc, jump_if, reachable) in ordered {
            let meta = meta_of(doc).map_err(|e| Error::Spec(e.to_string()))?;
            let record = registry
                .lookup(&meta.kind)
                .ok_or_else(|| Error::Spec(SpecError::UnknownKind(meta.kind.clone()).to_string()))?
                .clone();

            let prev_instance = previous
                .and_then(|p| p.filter_instance(&meta.name))
                .filter(|inst| inst.kind() == record.kind);

            let instance = (record.construct)(ConstructArgs {
                meta: &meta,
                spec: doc,
                previous: prev_instance,
                deps,
            })
            .await
            .map_err(|e| Error::construct(&meta.name, e.to_string()))?;

            let filter = RunningFilter {
                meta,
                jump_if: jump_if.cloned().unwrap_or_default(),
                record,
                instance,
            };
            if reachable {
                running.push(filter);
            } else {
                standby.push(filter);
            }
        }

        let pipeline = Arc::new(Self {
            spec,
            running,
            standby,
            handlers,
        });

        if let Some(previous) = previous {
            for old in previous.running.iter().chain(&previous.standby) {
                let adopted = pipeline
                    .filter_instance(&old.meta.name)
                    .is_some_and(|new| Arc::ptr_eq(&new, &old.instance));
                if !adopted {
                    debug!(filter = %old.meta.name, "closing filter dropped by reload");
                    old.instance.close();
                }
            }
        }

        pipeline
            .handlers
            .insert(pipeline.spec.name.clone(), Arc::clone(&pipeline));

        Ok(pipeline)
    }

    /// Pipeline name
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The spec this pipeline was compiled from
    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    /// The instance of the named filter, whether walked or standby
    pub fn filter_instance(&self, name: &str) -> Option<Arc<dyn Filter>> {
        self.running
            .iter()
            .chain(&self.standby)
            .find(|rf| rf.meta.name == name)
            .map(|rf| Arc::clone(&rf.instance))
    }

    /// Walk the running filters for one request.
    ///
    /// Execution starts at the first running filter and proceeds in flow
    /// order. A filter returning a label consults its jump table: a hit
    /// moves execution to the target (forward only, by validation), a miss
    /// terminates the walk. A filter returning `None` falls through to the
    /// next filter. The walk's stats are summarized into a tag on the
    /// request context.
    pub async fn handle(&self, ctx: &mut RequestContext) {
        let pipe_ctx = new_pipeline_context(ctx.id());

        let mut next_name = self.running[0].meta.name.clone();
        for i in 0..self.running.len() {
            if next_name == LABEL_END {
                break;
            }
            let rf = &self.running[i];
            if rf.meta.name != next_name {
                continue;
            }

            let start = Instant::now();
            let result = rf.instance.handle(ctx).await;
            let duration = start.elapsed();

            pipe_ctx.lock().filter_stats.push(FilterStat {
                name: rf.meta.name.clone(),
                kind: rf.meta.kind.clone(),
                result: result.clone().unwrap_or_default(),
                duration,
            });

            match result {
                Some(label) => {
                    if !rf.record.declares_result(&label) {
                        error!(
                            filter = %rf.meta.name,
                            result = %label,
                            declared = ?rf.record.results,
                            "BUG: filter returned undeclared result",
                        );
                        break;
                    }
                    match rf.jump_if.get(&label) {
                        Some(target) => next_name = target.clone(),
                        None => break,
                    }
                }
                None => {
                    if i + 1 < self.running.len() {
                        next_name = self.running[i + 1].meta.name.clone();
                    }
                }
            }
        }

        ctx.add_tag(format!("pipeline: {}", pipe_ctx.lock().log()));
        delete_pipeline_context(ctx.id());
    }

    /// Aggregate every filter's status document.
    ///
    /// Callers must not invoke this concurrently with construction of the
    /// pipeline.
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            timestamp: chrono::Utc::now().timestamp(),
            filters: self
                .running
                .iter()
                .chain(&self.standby)
                .map(|rf| (rf.meta.name.clone(), rf.instance.status()))
                .collect(),
        }
    }

    /// Close every filter and remove this pipeline from the handler map
    pub fn close(&self) {
        self.handlers.remove(&self.spec.name);
        for rf in self.running.iter().chain(&self.standby) {
            rf.instance.close();
        }
    }
}

/// Pair each filter spec document with its jump table and reachability, in
/// materialization order.
///
/// With a non-empty flow, flow filters come first in flow order and the
/// remaining declared filters follow as unreachable standbys. With an empty
/// flow, every filter is reachable in declaration order with no jumps.
fn resolve_order(
    spec: &PipelineSpec,
) -> Result<Vec<(&serde_yaml::Value, Option<&HashMap<String, String>>, bool)>> {
    if spec.flow.is_empty() {
        return Ok(spec.filters.iter().map(|doc| (doc, None, true)).collect());
    }

    let mut ordered = spec
        .flow
        .iter()
        .map(|FlowStep { filter, jump_if }| {
            spec.filter_doc(filter)
                .map(|doc| (doc, Some(jump_if), true))
                .ok_or_else(|| {
                    // Cannot occur once the spec passed validation.
                    Error::Spec(SpecError::FlowUnknownFilter(filter.clone()).to_string())
                })
        })
        .collect::<Result<Vec<_>>>()?;

    let in_flow: Vec<&str> = spec.flow.iter().map(|step| step.filter.as_str()).collect();
    for doc in &spec.filters {
        let named_in_flow = matches!(
            meta_of(doc),
            Ok(meta) if in_flow.contains(&meta.name.as_str())
        );
        if !named_in_flow {
            ordered.push((doc, None, false));
        }
    }

    Ok(ordered)
}
