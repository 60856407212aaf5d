//! Process-wide catalog of filter kinds

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::filter::{Filter, FilterMeta};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// External collaborators a filter may need at construction time
#[derive(Debug, Clone, Default)]
pub struct FilterDeps {
    /// Cluster KV handle for filters that source state from the cluster
    pub cluster: Option<Arc<dyn Cluster>>,
}

/// Arguments handed to a kind's constructor
pub struct ConstructArgs<'a> {
    /// Parsed filter meta
    pub meta: &'a FilterMeta,
    /// The raw spec document for this filter
    pub spec: &'a serde_yaml::Value,
    /// Predecessor instance with the same name and kind, during a reload
    pub previous: Option<Arc<dyn Filter>>,
    /// External collaborators
    pub deps: &'a FilterDeps,
}

impl fmt::Debug for ConstructArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstructArgs")
            .field("meta", &self.meta)
            .field("has_previous", &self.previous.is_some())
            .finish()
    }
}

/// Produces the default spec document for a kind
pub type DefaultSpecFn = fn() -> serde_yaml::Value;

/// Validates a raw spec document against the kind's typed spec
pub type ValidateFn = fn(&serde_yaml::Value) -> Result<()>;

/// Builds a filter instance from a validated spec document
pub type ConstructFn = for<'a> fn(ConstructArgs<'a>) -> BoxFuture<'a, Result<Arc<dyn Filter>>>;

/// Registry entry describing one filter kind
#[derive(Clone)]
pub struct FilterRecord {
    /// Kind identifier
    pub kind: &'static str,
    /// Every result label a filter of this kind may return from handle
    pub results: &'static [&'static str],
    /// Default spec factory
    pub default_spec: DefaultSpecFn,
    /// Spec schema check
    pub validate: ValidateFn,
    /// Constructor
    pub construct: ConstructFn,
}

impl FilterRecord {
    /// Whether `label` is one of the declared result labels
    pub fn declares_result(&self, label: &str) -> bool {
        self.results.contains(&label)
    }
}

impl fmt::Debug for FilterRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRecord")
            .field("kind", &self.kind)
            .field("results", &self.results)
            .finish()
    }
}

/// Catalog mapping a filter kind to its registry entry.
///
/// Built once at startup and read-only thereafter; lookups need no
/// synchronization.
#[derive(Debug, Default)]
pub struct FilterRegistry {
    records: HashMap<&'static str, FilterRecord>,
}

impl FilterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record; registering the same kind twice is a startup error
    pub fn register(&mut self, record: FilterRecord) -> Result<()> {
        if self.records.contains_key(record.kind) {
            return Err(Error::DuplicateKind(record.kind.to_string()));
        }
        self.records.insert(record.kind, record);
        Ok(())
    }

    /// Look up the record for a kind
    pub fn lookup(&self, kind: &str) -> Option<&FilterRecord> {
        self.records.get(kind)
    }

    /// Registered kinds, in no particular order
    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.records.keys().copied()
    }
}
