use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::runtime::NodeRuntime;

/// An actor: a `(source, slot)` triple binding a consumer's logical input
/// slot to one of a producer's output slots. Several dependencies sharing
/// `name` are concatenated, in list order, into one logical input stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dependency {
    pub source: String,
    pub name: String,
    pub slot: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
}

impl Dependency {
    pub fn new(source: impl Into<String>, name: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            slot: slot.into(),
            schema: None,
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    fn key(&self) -> (&str, &str, &str) {
        (self.source.as_str(), self.name.as_str(), self.slot.as_str())
    }
}

impl PartialEq for Dependency {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for Dependency {}

/// An actor body. Runs on its own OS thread (see SPEC_FULL.md §5) and is
/// handed a runtime surface scoped to its own node.
pub type ActorFn = Arc<dyn Fn(&mut NodeRuntime) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub func: ActorFn,
    pub dependencies: Vec<Dependency>,
    pub explain: Option<String>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("explain", &self.explain)
            .finish()
    }
}

/// Strip a trailing numeric `.<seqno>` suffix, if present — this is how
/// `get_next_name` re-derives a fresh name from an already-suffixed one
/// instead of accreting `.3.7.12...`. Grounded on
/// `pylib-v1/ailets/cons/util.py::to_basename`.
pub fn to_basename(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((base, suffix)) if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) => {
            base
        }
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_strips_numeric_suffix_only() {
        assert_eq!(to_basename("echo.12"), "echo");
        assert_eq!(to_basename("echo"), "echo");
        assert_eq!(to_basename("gpt4o.response"), "gpt4o.response");
    }
}
