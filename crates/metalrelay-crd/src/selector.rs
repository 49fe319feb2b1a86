//! Equality-based label selectors

use crate::{CrdError, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// A conjunction of `key=value` label requirements
///
/// An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Selector matching everything
    pub fn everything() -> Self {
        Self::default()
    }

    /// Add a requirement
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Check whether a label set satisfies every requirement
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.requirements
            .iter()
            .all(|(k, v)| labels.get(k).map(|actual| actual == v).unwrap_or(false))
    }
}

impl FromStr for LabelSelector {
    type Err = CrdError;

    fn from_str(s: &str) -> Result<Self> {
        let mut selector = LabelSelector::default();
        for term in s.split(',') {
            let (key, value) = term
                .split_once('=')
                .ok_or_else(|| CrdError::InvalidSelector(s.to_string()))?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.contains('=') {
                return Err(CrdError::InvalidSelector(s.to_string()));
            }
            selector.requirements.insert(key.to_string(), value.to_string());
        }
        Ok(selector)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .requirements
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}", terms.join(","))
    }
}
