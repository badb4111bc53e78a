//! Workflow definitions: a graph of assistant nodes joined by routing edges.
//!
//! ```yaml
//! kind: workflow
//! id: support-desk
//! name: "Support desk"
//! nodes:
//!   - id: triage
//!     assistant_id: triage-bot
//!     is_start: true
//!   - id: billing
//!     assistant_id: billing-bot
//! edges:
//!   - source: triage
//!     target: billing
//!     mode: bidirectional
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Workflow id that always compiles to the single-node conversational graph.
pub const FALLBACK_WORKFLOW_ID: &str = "__fallback__";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSpec {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Ordered node list; exactly one must be flagged `is_start`.
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,

    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowNode {
    pub id: String,

    /// Id of the assistant this node runs.
    #[serde(alias = "assistantId")]
    pub assistant_id: String,

    /// Editor canvas position; carried through untouched.
    #[serde(default)]
    pub position: Option<NodePosition>,

    #[serde(default, alias = "isStart")]
    pub is_start: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NodePosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeMode {
    /// Control may pass from source to target only.
    #[default]
    Single,
    /// Control may pass in either direction.
    Bidirectional,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowEdge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub mode: EdgeMode,
}

impl WorkflowSpec {
    /// Parse a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::InvalidSpec(format!("Failed to parse workflow YAML: {}", e)))
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Check structural invariants: unique node ids and edges that only
    /// reference nodes of this spec.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(EngineError::InvalidSpec(format!(
                    "workflow '{}' has duplicate node id '{}'",
                    self.id, node.id
                )));
            }
        }
        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(EngineError::InvalidSpec(format!(
                        "workflow '{}' has an edge referencing unknown node '{}'",
                        self.id, endpoint
                    )));
                }
            }
        }
        Ok(())
    }

    /// The single node flagged as start.
    pub fn start_node(&self) -> Result<&WorkflowNode> {
        let mut starts = self.nodes.iter().filter(|n| n.is_start);
        match (starts.next(), starts.next()) {
            (Some(node), None) => Ok(node),
            (None, _) => Err(EngineError::InvalidSpec(format!(
                "workflow '{}' has no start node",
                self.id
            ))),
            (Some(_), Some(_)) => Err(EngineError::InvalidSpec(format!(
                "workflow '{}' has more than one start node",
                self.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, start: bool) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            assistant_id: format!("{}-bot", id),
            position: None,
            is_start: start,
        }
    }

    #[test]
    fn test_parse_workflow_yaml() {
        let yaml = r#"
id: support
name: "Support"
nodes:
  - id: triage
    assistant_id: triage-bot
    isStart: true
    position: { x: 10.0, y: 20.0 }
  - id: billing
    assistantId: billing-bot
edges:
  - source: triage
    target: billing
    mode: bidirectional
  - source: billing
    target: triage
"#;
        let wf = WorkflowSpec::from_yaml(yaml).unwrap();
        assert_eq!(wf.nodes.len(), 2);
        assert!(wf.nodes[0].is_start);
        assert_eq!(wf.nodes[1].assistant_id, "billing-bot");
        assert_eq!(wf.edges[0].mode, EdgeMode::Bidirectional);
        assert_eq!(wf.edges[1].mode, EdgeMode::Single);
        assert!(wf.validate().is_ok());
        assert_eq!(wf.start_node().unwrap().id, "triage");
    }

    #[test]
    fn test_start_node_must_be_unique() {
        let mut wf = WorkflowSpec {
            id: "wf".to_string(),
            name: String::new(),
            nodes: vec![node("a", false), node("b", false)],
            edges: vec![],
        };
        assert!(wf.start_node().is_err());
        wf.nodes[0].is_start = true;
        wf.nodes[1].is_start = true;
        assert!(wf.start_node().is_err());
        wf.nodes[1].is_start = false;
        assert_eq!(wf.start_node().unwrap().id, "a");
    }

    #[test]
    fn test_edge_to_unknown_node_is_rejected() {
        let wf = WorkflowSpec {
            id: "wf".to_string(),
            name: String::new(),
            nodes: vec![node("a", true)],
            edges: vec![WorkflowEdge {
                source: "a".to_string(),
                target: "ghost".to_string(),
                mode: EdgeMode::Single,
            }],
        };
        let err = wf.validate().unwrap_err().to_string();
        assert!(err.contains("ghost"));
    }
}
