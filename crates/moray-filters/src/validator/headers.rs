//! Header rule sub-validator

use moray_core::{Error, RequestContext, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Acceptance rule for one request header.
///
/// A value passes when it is in `values` or matches `regexp`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderRule {
    /// Explicit allowlist
    #[serde(default)]
    pub values: Vec<String>,

    /// Pattern alternative to the allowlist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regexp: Option<String>,
}

pub(super) fn check_rules(rules: &HashMap<String, HeaderRule>) -> Result<()> {
    for (header, rule) in rules {
        if let Some(pattern) = &rule.regexp {
            Regex::new(pattern).map_err(|e| {
                Error::Spec(format!("header '{header}': invalid regexp: {e}"))
            })?;
        }
    }
    Ok(())
}

#[derive(Debug)]
struct CompiledRule {
    header: String,
    values: Vec<String>,
    regexp: Option<Regex>,
}

/// Requires every configured header to be present and pass its rule
#[derive(Debug)]
pub(super) struct HeadersValidator {
    rules: Vec<CompiledRule>,
}

impl HeadersValidator {
    pub(super) fn new(rules: HashMap<String, HeaderRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|(header, rule)| {
                let regexp = match &rule.regexp {
                    Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                        Error::Spec(format!("header '{header}': invalid regexp: {e}"))
                    })?),
                    None => None,
                };
                Ok(CompiledRule {
                    header,
                    values: rule.values,
                    regexp,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub(super) fn validate(&self, ctx: &RequestContext) -> bool {
        self.rules.iter().all(|rule| {
            let Some(value) = ctx.header(&rule.header) else {
                return false;
            };
            rule.values.iter().any(|v| v == value)
                || rule.regexp.as_ref().is_some_and(|re| re.is_match(value))
        })
    }
}
