//! Full-state export/import and graph visualization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;

use super::controller::{ids, snapshot};
use super::{GraphController, GraphStatistics, PathStatus, ResearchPath};
use crate::error::{ResearchError, ResearchResult};
use crate::storage::{GraphOperation, OperationType};

/// Export format version understood by [`GraphController::import_state`].
pub const EXPORT_VERSION: &str = "1.0";

/// Full graph state of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphExport {
    pub version: String,
    pub session_id: String,
    pub exported_at: DateTime<Utc>,
    pub statistics: GraphStatistics,
    pub paths: Vec<ResearchPath>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Operation log entry without its replay payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub operation_id: String,
    pub operation_type: OperationType,
    pub input_nodes: Vec<String>,
    pub output_nodes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&GraphOperation> for HistoryEntry {
    fn from(op: &GraphOperation) -> Self {
        Self {
            operation_id: op.operation_id.clone(),
            operation_type: op.operation_type,
            input_nodes: op.input_nodes.clone(),
            output_nodes: op.output_nodes.clone(),
            created_at: op.created_at,
        }
    }
}

/// Node of the visualization graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PathStatus>,
    pub score: f64,
    pub depth: u32,
}

/// Directed edge of the visualization graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub edge_type: String,
}

/// Node/edge lists for rendering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphVisualization {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

const ROOT_ID: &str = "root";

impl GraphController {
    /// Snapshot of the full graph state.
    pub fn export_state(&self) -> GraphExport {
        GraphExport {
            version: EXPORT_VERSION.to_string(),
            session_id: self.session_id.clone(),
            exported_at: Utc::now(),
            statistics: self.statistics(),
            paths: self.paths.clone(),
            history: self.history.iter().map(HistoryEntry::from).collect(),
        }
    }

    /// Replace the path set with an exported one. Returns the number of imported paths.
    ///
    /// The import is one `Import` operation; the exported history is not replayed.
    pub async fn import_state(&mut self, export: GraphExport) -> ResearchResult<usize> {
        if export.version != EXPORT_VERSION {
            return Err(ResearchError::validation(
                "version",
                format!("unsupported export version {}", export.version),
            ));
        }
        let mut seen: HashSet<String> = HashSet::new();
        for path in &export.paths {
            if path.id.trim().is_empty() {
                return Err(ResearchError::validation("paths", "path id must not be empty"));
            }
            if !seen.insert(path.id.clone()) {
                return Err(ResearchError::validation(
                    "paths",
                    format!("duplicate path id {}", path.id),
                ));
            }
            if path.metadata.depth > path.metadata.max_depth {
                return Err(ResearchError::validation(
                    "paths",
                    format!(
                        "path {} has depth {} beyond its maximum {}",
                        path.id, path.metadata.depth, path.metadata.max_depth
                    ),
                ));
            }
            if !(0.0..=10.0).contains(&path.score) {
                return Err(ResearchError::validation(
                    "paths",
                    format!("path {} has score {} outside 0-10", path.id, path.score),
                ));
            }
        }

        let imported = export.paths;
        let removed: Vec<String> = self
            .paths
            .iter()
            .filter(|p| !seen.contains(p.id.as_str()))
            .map(|p| p.id.clone())
            .collect();

        let op = GraphOperation::new(&self.session_id, OperationType::Import)
            .with_inputs(ids(&self.paths))
            .with_outputs(ids(&imported))
            .with_payload(snapshot(&imported)?);
        self.commit(vec![op], imported.clone(), removed).await?;

        self.paths = imported;

        info!(
            session_id = %self.session_id,
            source_session = %export.session_id,
            paths = self.paths.len(),
            "Graph state imported"
        );
        Ok(self.paths.len())
    }

    /// Node/edge lists rooted at a `topic` node.
    pub fn visualize_json(&self, topic: &str) -> GraphVisualization {
        let mut viz = GraphVisualization::default();
        viz.nodes.push(GraphNode {
            id: ROOT_ID.to_string(),
            label: topic.to_string(),
            node_type: "topic".to_string(),
            status: None,
            score: 0.0,
            depth: 0,
        });

        for path in &self.paths {
            viz.nodes.push(GraphNode {
                id: path.id.clone(),
                label: path.focus.clone(),
                node_type: path.metadata.kind.to_string(),
                status: Some(path.status),
                score: path.score,
                depth: path.metadata.depth,
            });
            if path.is_aggregated() {
                for parent in &path.metadata.parent_ids {
                    viz.edges.push(GraphEdge {
                        source: parent.clone(),
                        target: path.id.clone(),
                        edge_type: "aggregates".to_string(),
                    });
                }
            } else {
                viz.edges.push(GraphEdge {
                    source: ROOT_ID.to_string(),
                    target: path.id.clone(),
                    edge_type: "explores".to_string(),
                });
            }
        }
        viz
    }

    /// GraphViz DOT rendering of [`Self::visualize_json`].
    pub fn visualize_dot(&self, topic: &str) -> String {
        let viz = self.visualize_json(topic);
        let mut dot = String::from("digraph research {\n    rankdir=LR;\n    node [fontname=\"Helvetica\"];\n");

        for node in &viz.nodes {
            let (shape, color) = match (node.node_type.as_str(), node.status) {
                ("topic", _) => ("box", "lightgrey"),
                (_, Some(PathStatus::Pruned)) => ("ellipse", "mistyrose"),
                ("aggregated", _) => ("doubleoctagon", "palegreen"),
                (_, Some(PathStatus::Completed)) => ("ellipse", "lightblue"),
                _ => ("ellipse", "white"),
            };
            let label = if node.node_type == "topic" {
                escape(&node.label)
            } else {
                format!("{}\\n{:.1}", escape(&node.label), node.score)
            };
            dot.push_str(&format!(
                "    \"{}\" [label=\"{}\", shape={}, style=filled, fillcolor={}];\n",
                escape(&node.id),
                label,
                shape,
                color
            ));
        }
        for edge in &viz.edges {
            let style = if edge.edge_type == "aggregates" { "dashed" } else { "solid" };
            dot.push_str(&format!(
                "    \"{}\" -> \"{}\" [style={}];\n",
                escape(&edge.source),
                escape(&edge.target),
                style
            ));
        }
        dot.push_str("}\n");
        dot
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}
