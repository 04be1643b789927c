//! Context aggregation: the knowledge an agent sees for one node.
//!
//! The view is rebuilt from a single graph snapshot on every call:
//!
//! - **chain**: root-to-target ancestry, cut above the nearest `isolate` node.
//! - **references**: active cross-node references of the target, deduplicated.
//! - **child_conclusions**: finished children of a monitoring planning target.
//!
//! Only active document links are shown; expired links stay in the graph.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::path::node_path;
use crate::error::Result;
use crate::graph::{Graph, LogEntry, Node, NodeKind, PlanningStatus, Status};

/// Knobs controlling how much of each frame is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextOptions {
    pub include_log: bool,
    pub max_log_entries: usize,
    /// Render logs newest first.
    pub reverse_log: bool,
    pub include_problem: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            include_log: true,
            max_log_entries: 20,
            reverse_log: false,
            include_problem: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentView {
    pub id: String,
    pub title: String,
    pub content: String,
}

/// One node as rendered into a context view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub node_id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub status: Status,
    pub title: String,
    pub path: String,
    pub isolate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    pub documents: Vec<DocumentView>,
    pub log: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextView {
    pub node_id: String,
    pub chain: Vec<Frame>,
    pub references: Vec<Frame>,
    pub child_conclusions: Vec<Frame>,
}

/// Build the context view for `node_id`. Never mutates `graph`.
pub fn aggregate(graph: &Graph, node_id: &str, options: &ContextOptions) -> Result<ContextView> {
    let target = graph.require(node_id)?;

    let mut lineage: Vec<&Node> = vec![target];
    if !target.isolate {
        for ancestor in graph.ancestors(node_id) {
            lineage.push(ancestor);
            if ancestor.isolate {
                break;
            }
        }
    }
    lineage.reverse();

    let mut seen: HashSet<&str> = lineage.iter().map(|node| node.id.as_str()).collect();
    let chain = lineage
        .iter()
        .map(|node| build_frame(graph, node, options))
        .collect();

    let mut references = Vec::new();
    for reference in target.references.iter().filter(|r| r.status.is_active()) {
        let Some(node) = graph.node(&reference.node_id) else {
            continue;
        };
        if seen.insert(node.id.as_str()) {
            references.push(build_frame(graph, node, options));
        }
    }

    let child_conclusions = if target.status() == Status::Planning(PlanningStatus::Monitoring) {
        graph
            .children_of(node_id)
            .into_iter()
            .filter(|child| child.is_terminal())
            .map(|child| build_frame(graph, child, options))
            .collect()
    } else {
        Vec::new()
    };

    Ok(ContextView {
        node_id: node_id.to_string(),
        chain,
        references,
        child_conclusions,
    })
}

fn build_frame(graph: &Graph, node: &Node, options: &ContextOptions) -> Frame {
    let documents = node
        .documents
        .iter()
        .filter(|link| link.status.is_active())
        .filter_map(|link| graph.documents.get(&link.document_id))
        .map(|doc| DocumentView {
            id: doc.id.clone(),
            title: doc.title.clone(),
            content: doc.content.clone(),
        })
        .collect();

    Frame {
        node_id: node.id.clone(),
        kind: node.kind(),
        status: node.status(),
        title: node.title.clone(),
        path: node_path(graph, &node.id).unwrap_or_else(|| node.id.clone()),
        isolate: node.isolate,
        problem: if options.include_problem {
            node.problem.clone()
        } else {
            None
        },
        documents,
        log: select_log(&node.log, options),
        conclusion: node.conclusion.clone(),
    }
}

/// Most recent `max_log_entries` entries, oldest first unless `reverse_log`.
fn select_log(log: &[LogEntry], options: &ContextOptions) -> Vec<LogEntry> {
    if !options.include_log {
        return Vec::new();
    }
    let skip = log.len().saturating_sub(options.max_log_entries);
    let mut entries: Vec<LogEntry> = log[skip..].to_vec();
    if options.reverse_log {
        entries.reverse();
    }
    entries
}
