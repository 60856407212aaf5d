//! The filter contract

use crate::context::RequestContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The built-in jump target that terminates pipeline execution.
///
/// It is reserved: no filter may use it as its name.
pub const LABEL_END: &str = "END";

/// Name and kind shared by every filter spec document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterMeta {
    /// Filter name, unique within a pipeline
    pub name: String,
    /// Filter kind, resolved through the registry
    pub kind: String,
}

/// A pluggable request-processing unit.
///
/// Filter instances are shared as `Arc<dyn Filter>` and invoked from
/// arbitrarily many request handlers concurrently; implementations must be
/// safe under concurrent [`Filter::handle`] calls.
#[async_trait]
pub trait Filter: Send + Sync + fmt::Debug {
    /// The registry kind this instance was constructed for
    fn kind(&self) -> &'static str;

    /// Process a request.
    ///
    /// Returns `None` to proceed to the next filter in flow, or a result
    /// label. Any returned label must be one the kind declared at
    /// registration; the engine logs a bug and terminates the pipeline
    /// otherwise.
    async fn handle(&self, ctx: &mut RequestContext) -> Option<String>;

    /// Snapshot of runtime metrics and state.
    ///
    /// Must not be called concurrently with construction.
    fn status(&self) -> serde_json::Value;

    /// Release resources. Idempotent; the filter is never handled again
    /// after close.
    fn close(&self);
}
