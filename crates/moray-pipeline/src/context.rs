//! Per-request pipeline context and the process-wide context table

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Statistics of one executed filter
#[derive(Debug, Clone)]
pub struct FilterStat {
    /// Filter name
    pub name: String,
    /// Filter kind
    pub kind: String,
    /// Returned result label, empty when the filter proceeded
    pub result: String,
    /// Wall-clock duration of the handle call
    pub duration: Duration,
}

impl FilterStat {
    fn log(&self) -> String {
        let mut result = self.result.clone();
        if !result.is_empty() {
            result.push(',');
        }
        format!("{}({}{:?})", self.name, result, self.duration)
    }
}

/// Per-request scratch of a pipeline walk.
///
/// One exists per in-flight request, associated with the request context for
/// the duration of handling and discarded immediately after.
#[derive(Debug, Default)]
pub struct PipelineContext {
    /// Stats of executed filters, in execution order
    pub filter_stats: Vec<FilterStat>,
}

impl PipelineContext {
    /// Human-readable summary of the walk, attached to the request as a tag
    pub fn log(&self) -> String {
        if self.filter_stats.is_empty() {
            return "<empty>".to_string();
        }
        self.filter_stats
            .iter()
            .map(FilterStat::log)
            .collect::<Vec<_>>()
            .join("->")
    }
}

// request-context id -> PipelineContext of the in-flight request
static RUNNING_CONTEXTS: Lazy<DashMap<u64, Arc<Mutex<PipelineContext>>>> = Lazy::new(DashMap::new);

pub(crate) fn new_pipeline_context(ctx_id: u64) -> Arc<Mutex<PipelineContext>> {
    let pipe_ctx = Arc::new(Mutex::new(PipelineContext::default()));
    RUNNING_CONTEXTS.insert(ctx_id, Arc::clone(&pipe_ctx));
    pipe_ctx
}

/// The pipeline context of an in-flight request, for diagnostic use from
/// within a filter. Returns `None` once the request's handle call exits.
pub fn get_pipeline_context(ctx_id: u64) -> Option<Arc<Mutex<PipelineContext>>> {
    RUNNING_CONTEXTS.get(&ctx_id).map(|e| Arc::clone(e.value()))
}

pub(crate) fn delete_pipeline_context(ctx_id: u64) {
    RUNNING_CONTEXTS.remove(&ctx_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(name: &str, result: &str, micros: u64) -> FilterStat {
        FilterStat {
            name: name.to_string(),
            kind: "Mock".to_string(),
            result: result.to_string(),
            duration: Duration::from_micros(micros),
        }
    }

    #[test]
    fn test_empty_walk_log() {
        assert_eq!(PipelineContext::default().log(), "<empty>");
    }

    #[test]
    fn test_walk_log_format() {
        let ctx = PipelineContext {
            filter_stats: vec![stat("auth", "", 100), stat("deny", "invalid", 250)],
        };
        assert_eq!(ctx.log(), "auth(100µs)->deny(invalid,250µs)");
    }

    #[test]
    fn test_context_table_roundtrip() {
        let pipe_ctx = new_pipeline_context(424242);
        pipe_ctx.lock().filter_stats.push(stat("auth", "", 1));

        let found = get_pipeline_context(424242).unwrap();
        assert_eq!(found.lock().filter_stats.len(), 1);

        delete_pipeline_context(424242);
        assert!(get_pipeline_context(424242).is_none());
    }
}
