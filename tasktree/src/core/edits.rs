//! Graph edits outside the status lifecycle: links, documents, logs, removal.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use super::ids::validate_id;
use crate::error::{Error, Result};
use crate::graph::{Document, DocumentLink, Graph, LinkStatus, LogEntry, Reference};

/// Add (or reactivate) a reference from `node_id` to `target`.
///
/// Returns false when an active reference already existed.
pub fn add_reference(graph: &mut Graph, node_id: &str, target: &str, now: DateTime<Utc>) -> Result<bool> {
    graph.require(target)?;
    if node_id == target {
        return Err(Error::InvalidId {
            id: target.to_string(),
            reason: "a node cannot reference itself".to_string(),
        });
    }
    let node = graph.require_mut(node_id)?;
    let changed = match node.references.iter_mut().find(|r| r.node_id == target) {
        Some(existing) if existing.status.is_active() => false,
        Some(existing) => {
            existing.status = LinkStatus::Active;
            true
        }
        None => {
            node.references.push(Reference {
                node_id: target.to_string(),
                status: LinkStatus::Active,
            });
            true
        }
    };
    if changed {
        node.updated_at = now;
    }
    Ok(changed)
}

pub fn expire_reference(graph: &mut Graph, node_id: &str, target: &str, now: DateTime<Utc>) -> Result<()> {
    let node = graph.require_mut(node_id)?;
    let reference = node
        .references
        .iter_mut()
        .find(|r| r.node_id == target)
        .ok_or_else(|| Error::ReferenceNotFound {
            node_id: node_id.to_string(),
            target: target.to_string(),
        })?;
    reference.status = LinkStatus::Expired;
    node.updated_at = now;
    Ok(())
}

/// Store `document` in the workspace and link it to `node_id`.
///
/// An existing document with the same id is replaced; an expired link is
/// reactivated.
pub fn add_document(graph: &mut Graph, node_id: &str, document: Document, now: DateTime<Utc>) -> Result<()> {
    validate_id(&document.id)?;
    let node = graph.require_mut(node_id)?;
    match node
        .documents
        .iter_mut()
        .find(|link| link.document_id == document.id)
    {
        Some(link) => link.status = LinkStatus::Active,
        None => node.documents.push(DocumentLink {
            document_id: document.id.clone(),
            status: LinkStatus::Active,
        }),
    }
    node.updated_at = now;
    graph.documents.insert(document.id.clone(), document);
    Ok(())
}

/// Hide a document from `node_id`'s context without deleting it.
pub fn expire_document(graph: &mut Graph, node_id: &str, document_id: &str, now: DateTime<Utc>) -> Result<()> {
    let node = graph.require_mut(node_id)?;
    let link = node
        .documents
        .iter_mut()
        .find(|link| link.document_id == document_id)
        .ok_or_else(|| Error::DocumentNotFound(document_id.to_string()))?;
    link.status = LinkStatus::Expired;
    node.updated_at = now;
    Ok(())
}

pub fn append_log(graph: &mut Graph, node_id: &str, message: &str, now: DateTime<Utc>) -> Result<()> {
    let node = graph.require_mut(node_id)?;
    node.log.push(LogEntry {
        at: now,
        message: message.trim_end().to_string(),
    });
    node.updated_at = now;
    Ok(())
}

pub fn set_isolate(graph: &mut Graph, node_id: &str, isolate: bool, now: DateTime<Utc>) -> Result<()> {
    let node = graph.require_mut(node_id)?;
    if node.isolate != isolate {
        node.isolate = isolate;
        node.updated_at = now;
    }
    Ok(())
}

/// Ids in the subtree rooted at `node_id` (inclusive), parents before children.
pub fn subtree_ids(graph: &Graph, node_id: &str) -> Result<Vec<String>> {
    graph.require(node_id)?;
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    let mut stack = vec![node_id.to_string()];
    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(node) = graph.node(&id) {
            stack.extend(node.children.iter().rev().cloned());
        }
        out.push(id);
    }
    Ok(out)
}

/// Remove the subtree rooted at `node_id` and prune links into it.
///
/// Refuses while any node in the subtree holds an active dispatch record.
pub fn remove_subtree(graph: &mut Graph, workspace: &str, node_id: &str) -> Result<Vec<String>> {
    let removed = subtree_ids(graph, node_id)?;
    if let Some(active) = removed
        .iter()
        .filter_map(|id| graph.node(id))
        .find(|node| node.has_active_dispatch())
    {
        return Err(Error::DispatchConcurrencyConflict {
            workspace: workspace.to_string(),
            node_id: Some(active.id.clone()),
        });
    }

    let parent_id = graph.require(node_id)?.parent_id.clone();
    match parent_id {
        Some(parent_id) => {
            if let Some(parent) = graph.node_mut(&parent_id) {
                parent.children.retain(|child| child != node_id);
            }
        }
        None => graph.root_id = None,
    }

    let gone: BTreeSet<&str> = removed.iter().map(String::as_str).collect();
    for id in &removed {
        graph.nodes.remove(id);
    }
    for node in graph.nodes.values_mut() {
        node.references
            .retain(|reference| !gone.contains(reference.node_id.as_str()));
        if node
            .verified_by
            .as_deref()
            .is_some_and(|verifier| gone.contains(verifier))
        {
            node.verified_by = None;
        }
    }
    Ok(removed)
}
