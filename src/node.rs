use glob::Pattern;
use serde_yaml::Value;

use crate::coerce::{coerce_to_bool, coerce_to_string};
use crate::collab::NodeInfo;
use crate::diag::ValidationReport;

/// Canonical form of an action's `node` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSpec {
    /// Any available host.
    Any,
    Name { value: String, pattern: bool },
    Label { value: String, pattern: bool },
}

impl NodeSpec {
    /// Canonicalize the raw YAML node spec. A literal string is a node
    /// name, null means any host, and the mapping form carries `name` or
    /// `label` plus the `pattern` flag.
    pub fn parse(raw: &Value, report: &mut ValidationReport) -> Option<NodeSpec> {
        match raw {
            Value::Null => Some(NodeSpec::Any),
            Value::String(s) => Some(NodeSpec::Name {
                value: s.clone(),
                pattern: false,
            }),
            Value::Mapping(map) => {
                let name = map.get("name").and_then(coerce_to_string);
                let label = map.get("label").and_then(coerce_to_string);
                let pattern = match map.get("pattern") {
                    None => false,
                    Some(raw) => match coerce_to_bool(raw) {
                        Some(b) => b,
                        None => {
                            report.error("Node spec 'pattern' is not a boolean");
                            return None;
                        }
                    },
                };
                match (name, label) {
                    (Some(name), Some(_)) => {
                        report.warning(
                            "Node spec has both 'name' and 'label'; using 'name'".to_string(),
                        );
                        Some(NodeSpec::Name {
                            value: name,
                            pattern,
                        })
                    }
                    (Some(name), None) => Some(NodeSpec::Name {
                        value: name,
                        pattern,
                    }),
                    (None, Some(label)) => Some(NodeSpec::Label {
                        value: label,
                        pattern,
                    }),
                    (None, None) => {
                        report.error("Node spec mapping has neither 'name' nor 'label'");
                        None
                    }
                }
            }
            _ => {
                report.error("Node spec must be a string, null or a mapping");
                None
            }
        }
    }

    /// Resolve against the live registry. Non-pattern specs pass through
    /// unchanged; pattern specs glob over the registry and take the first
    /// match in registry order. `None` means no host matched.
    pub fn resolve(&self, nodes: &[NodeInfo]) -> Option<ResolvedNode> {
        match self {
            NodeSpec::Any => Some(ResolvedNode::Any),
            NodeSpec::Name {
                value,
                pattern: false,
            } => Some(ResolvedNode::Name(value.clone())),
            NodeSpec::Label {
                value,
                pattern: false,
            } => Some(ResolvedNode::Label(value.clone())),
            NodeSpec::Name {
                value,
                pattern: true,
            } => {
                let glob = Pattern::new(value).ok()?;
                nodes
                    .iter()
                    .find(|n| glob.matches(&n.name))
                    .map(|n| ResolvedNode::Name(n.name.clone()))
            }
            NodeSpec::Label {
                value,
                pattern: true,
            } => {
                let glob = Pattern::new(value).ok()?;
                nodes
                    .iter()
                    .find(|n| n.labels.iter().any(|l| glob.matches(l)))
                    .map(|n| ResolvedNode::Name(n.name.clone()))
            }
        }
    }
}

/// A node choice after registry resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedNode {
    Any,
    Name(String),
    Label(String),
}

impl ResolvedNode {
    /// The concrete host to re-dispatch onto, when one was named.
    pub fn host(&self) -> Option<&str> {
        match self {
            ResolvedNode::Name(name) => Some(name),
            _ => None,
        }
    }
}
