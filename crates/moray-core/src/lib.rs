//! # Moray Core
//!
//! Core types, traits, and error handling for the Moray gateway.
//!
//! This crate provides the foundational abstractions used throughout the
//! gateway:
//! - Per-request context (HTTP request, tags, cancellation)
//! - The `Filter` trait and filter metadata
//! - The process-wide filter registry
//! - The cluster key-value abstraction consumed by credential stores

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod cluster;
pub mod context;
pub mod error;
pub mod filter;
pub mod registry;

pub use cluster::{Cluster, KvSnapshot};
pub use context::{Body, RequestContext};
pub use error::{Error, Result};
pub use filter::{Filter, FilterMeta, LABEL_END};
pub use registry::{ConstructArgs, FilterDeps, FilterRecord, FilterRegistry};

// Re-export commonly used HTTP types
pub use bytes::Bytes;
pub use http::{Method, Request, Response, StatusCode};
