//! Declarative pipeline spec model

use crate::validate::SpecError;
use moray_core::FilterMeta;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// The pipeline kind identifier
pub const KIND: &str = "HTTPPipeline";

/// Declarative description of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Pipeline name, the key of the shared handler map
    pub name: String,

    /// Must be [`KIND`]
    pub kind: String,

    /// Execution order and jump tables. When empty, all filters execute in
    /// declaration order with no jumps.
    #[serde(default)]
    pub flow: Vec<FlowStep>,

    /// Raw per-kind filter spec documents, each embedding name and kind
    pub filters: Vec<serde_yaml::Value>,
}

/// One step of the pipeline flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStep {
    /// Name of a declared filter
    pub filter: String,

    /// Jump table keyed by result label; targets are later flow filters
    /// or `"END"`
    #[serde(default, rename = "jumpIf")]
    pub jump_if: HashMap<String, String>,
}

impl PipelineSpec {
    /// Parse a pipeline spec from YAML
    pub fn from_yaml(config: &str) -> Result<Self, SpecError> {
        serde_yaml::from_str(config).map_err(SpecError::Parse)
    }

    /// Load a pipeline spec from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SpecError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SpecError::Read(path.as_ref().display().to_string(), e))?;
        Self::from_yaml(&content)
    }

    /// The raw spec document of the named filter
    pub fn filter_doc(&self, name: &str) -> Option<&serde_yaml::Value> {
        self.filters
            .iter()
            .find(|doc| matches!(meta_of(doc), Ok(meta) if meta.name == name))
    }
}

/// Extract the [`FilterMeta`] embedded in a raw filter spec document
pub fn meta_of(doc: &serde_yaml::Value) -> Result<FilterMeta, SpecError> {
    #[derive(Deserialize)]
    struct RawMeta {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        kind: Option<String>,
    }

    let raw: RawMeta = serde_yaml::from_value(doc.clone()).map_err(SpecError::Parse)?;
    let name = match raw.name {
        Some(name) if !name.is_empty() => name,
        _ => return Err(SpecError::MetaMissingName),
    };
    let kind = match raw.kind {
        Some(kind) if !kind.is_empty() => kind,
        _ => return Err(SpecError::MetaMissingKind),
    };
    Ok(FilterMeta { name, kind })
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML_SPEC: &str = r#"
kind: HTTPPipeline
name: api
flow:
  - filter: auth
    jumpIf:
      invalid: END
  - filter: rewrite
filters:
  - name: auth
    kind: Validator
  - name: rewrite
    kind: RequestAdaptor
    addPrefix: /v1
"#;

    #[test]
    fn test_parse_yaml_spec() {
        let spec = PipelineSpec::from_yaml(YAML_SPEC).unwrap();
        assert_eq!(spec.name, "api");
        assert_eq!(spec.kind, KIND);
        assert_eq!(spec.flow.len(), 2);
        assert_eq!(
            spec.flow[0].jump_if.get("invalid").map(String::as_str),
            Some("END")
        );
        assert_eq!(spec.filters.len(), 2);
    }

    #[test]
    fn test_filter_doc_lookup() {
        let spec = PipelineSpec::from_yaml(YAML_SPEC).unwrap();
        assert!(spec.filter_doc("rewrite").is_some());
        assert!(spec.filter_doc("missing").is_none());
    }

    #[test]
    fn test_meta_extraction() {
        let spec = PipelineSpec::from_yaml(YAML_SPEC).unwrap();
        let meta = meta_of(&spec.filters[0]).unwrap();
        assert_eq!(meta.name, "auth");
        assert_eq!(meta.kind, "Validator");
    }

    #[test]
    fn test_meta_missing_name() {
        let doc: serde_yaml::Value = serde_yaml::from_str("kind: Validator").unwrap();
        assert!(matches!(meta_of(&doc), Err(SpecError::MetaMissingName)));
    }

    #[test]
    fn test_invalid_yaml_is_a_parse_error() {
        assert!(matches!(
            PipelineSpec::from_yaml("kind: [oops"),
            Err(SpecError::Parse(_))
        ));
    }
}
