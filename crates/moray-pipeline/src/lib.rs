//! # Moray Pipeline
//!
//! The request-processing pipeline: an ordered chain of filters that each
//! HTTP request traverses, with conditional jumps between filters keyed on
//! per-filter result labels.
//!
//! A pipeline is compiled from a declarative [`PipelineSpec`] (usually
//! YAML), validated by [`validate`], and executed by [`Pipeline::handle`].
//! Reloading a spec constructs a new pipeline that inherits matching filter
//! instances from its predecessor.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod context;
pub mod pipeline;
pub mod spec;
pub mod validate;

pub use context::{get_pipeline_context, FilterStat, PipelineContext};
pub use pipeline::{Pipeline, PipelineMap, PipelineStatus};
pub use spec::{FlowStep, PipelineSpec, KIND};
pub use validate::{validate, SpecError};
