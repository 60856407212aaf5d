//! Structural and semantic validation of pipeline specs

use crate::spec::{meta_of, PipelineSpec, KIND};
use moray_core::{FilterRegistry, LABEL_END};
use std::collections::HashSet;

/// A failed validation rule.
///
/// Each rule has its own variant so callers can report precisely which
/// invariant a spec violates. Validation failures abort the reload; nothing
/// is retried.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    /// The document does not parse into the spec model
    #[error("failed to parse spec: {0}")]
    Parse(#[source] serde_yaml::Error),

    /// The spec file cannot be read
    #[error("failed to read spec file '{0}': {1}")]
    Read(String, #[source] std::io::Error),

    /// The top-level kind is not `HTTPPipeline`
    #[error("pipeline kind must be '{KIND}', got '{0}'")]
    WrongKind(String),

    /// The pipeline name is missing
    #[error("pipeline name is required")]
    MissingName,

    /// The pipeline declares no filters
    #[error("pipeline must declare at least one filter")]
    NoFilters,

    /// A filter spec document lacks a name
    #[error("filter name is required")]
    MetaMissingName,

    /// A filter spec document lacks a kind
    #[error("filter kind is required")]
    MetaMissingKind,

    /// A filter is named after the reserved END label
    #[error("can't use '{LABEL_END}' (built-in label) for filter name")]
    ReservedName,

    /// Two filters share a name
    #[error("conflicting filter name '{0}'")]
    DuplicateName(String),

    /// A filter references a kind the registry does not know
    #[error("unsupported filter kind '{0}'")]
    UnknownKind(String),

    /// A filter spec document does not match its kind's schema
    #[error("invalid spec for filter '{name}': {message}")]
    FilterSpec {
        /// Filter name
        name: String,
        /// Failure detail from the kind's schema check
        message: String,
    },

    /// A flow step references a filter that is not declared
    #[error("flow references unknown filter '{0}'")]
    FlowUnknownFilter(String),

    /// A filter appears in the flow more than once
    #[error("filter '{0}' appears in flow more than once")]
    FlowRepeatedFilter(String),

    /// A jump table is keyed by a result label the kind never returns
    #[error("filter '{filter}': result '{result}' is not declared by kind '{kind}'")]
    UnknownResult {
        /// Flow filter name
        filter: String,
        /// Offending result label
        result: String,
        /// The filter's kind
        kind: String,
    },

    /// A jump target is neither END nor a later flow filter
    #[error("filter '{filter}': jump target '{target}' is not '{LABEL_END}' or a later flow filter")]
    InvalidJumpTarget {
        /// Flow filter name
        filter: String,
        /// Offending target
        target: String,
    },
}

/// Validate a pipeline spec against the registry.
///
/// Succeeds exactly when [`crate::Pipeline::new`] would succeed for the same
/// spec. Forward-only jump targets are enforced by a backward scan that
/// seeds the valid target set with `END` and admits each flow filter's name
/// only after its own step has been checked.
pub fn validate(spec: &PipelineSpec, registry: &FilterRegistry) -> Result<(), SpecError> {
    if spec.kind != KIND {
        return Err(SpecError::WrongKind(spec.kind.clone()));
    }
    if spec.name.is_empty() {
        return Err(SpecError::MissingName);
    }
    if spec.filters.is_empty() {
        return Err(SpecError::NoFilters);
    }

    let mut record_by_name = std::collections::HashMap::new();
    for doc in &spec.filters {
        let meta = meta_of(doc)?;
        if meta.name == LABEL_END {
            return Err(SpecError::ReservedName);
        }
        if record_by_name.contains_key(&meta.name) {
            return Err(SpecError::DuplicateName(meta.name));
        }

        let record = registry
            .lookup(&meta.kind)
            .ok_or_else(|| SpecError::UnknownKind(meta.kind.clone()))?;
        (record.validate)(doc).map_err(|e| SpecError::FilterSpec {
            name: meta.name.clone(),
            message: e.to_string(),
        })?;

        record_by_name.insert(meta.name, record);
    }

    let mut seen = HashSet::new();
    for step in &spec.flow {
        if !record_by_name.contains_key(&step.filter) {
            return Err(SpecError::FlowUnknownFilter(step.filter.clone()));
        }
        if !seen.insert(step.filter.as_str()) {
            return Err(SpecError::FlowRepeatedFilter(step.filter.clone()));
        }
    }

    let mut valid_targets = HashSet::from([LABEL_END]);
    for step in spec.flow.iter().rev() {
        let record = record_by_name[&step.filter];
        for (result, target) in &step.jump_if {
            if !record.declares_result(result) {
                return Err(SpecError::UnknownResult {
                    filter: step.filter.clone(),
                    result: result.clone(),
                    kind: record.kind.to_string(),
                });
            }
            if !valid_targets.contains(target.as_str()) {
                return Err(SpecError::InvalidJumpTarget {
                    filter: step.filter.clone(),
                    target: target.clone(),
                });
            }
        }
        valid_targets.insert(step.filter.as_str());
    }

    Ok(())
}
