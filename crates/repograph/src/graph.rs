#![forbid(unsafe_code)]

//! Read-side traversals over a stored graph.

use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::db::SqliteGraphStore;
use crate::error::StoreResult;
use crate::types::{Edge, Neighborhood, NeighborhoodQuery, Node, TraversalDirection};

/// A node reached through `DEPENDS_ON`, with its distance from the start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub node: Node,
    pub depth: usize,
}

/// Derived `DEPENDS_ON`: everything reachable from `id` over `IMPORTS`,
/// `CALLS` and `EXTENDS`, nearest first. The start node is not included.
pub fn depends_on(
    store: &SqliteGraphStore,
    id: &str,
    max_depth: usize,
) -> StoreResult<Vec<Dependency>> {
    let mut visited: HashSet<String> = HashSet::from([id.to_string()]);
    let mut queue = VecDeque::from([(id.to_string(), 0usize)]);
    let mut found = Vec::new();

    while let Some((node_id, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        for edge in store.edges_from(&node_id, None)? {
            if !edge.kind.is_dependency() || !visited.insert(edge.target.clone()) {
                continue;
            }
            if let Some(node) = store.node(&edge.target)? {
                found.push(Dependency {
                    node,
                    depth: depth + 1,
                });
            }
            queue.push_back((edge.target, depth + 1));
        }
    }

    Ok(found)
}

/// Nodes matching `name`: an exact qualified name (a dotted entity path or
/// a file path) first, then a bare name.
pub fn lookup(store: &SqliteGraphStore, name: &str) -> StoreResult<Vec<Node>> {
    let exact = store.find_nodes_by_qualified_name(name)?;
    if !exact.is_empty() {
        return Ok(exact);
    }
    store.find_nodes_by_name(name)
}

/// Bounded breadth-first neighbourhood of `roots`.
///
/// Each stored edge is reported once however many visited nodes it touches.
/// When `max_edges` runs out the walk stops expanding, but nodes already
/// reached are still reported so every returned edge has both endpoints.
pub fn neighborhood(
    store: &SqliteGraphStore,
    roots: &[String],
    query: &NeighborhoodQuery,
) -> StoreResult<Neighborhood> {
    let mut result = Neighborhood {
        roots: roots.to_vec(),
        nodes: BTreeMap::new(),
        edges: Vec::new(),
        truncated: false,
    };
    let mut reported: HashSet<Edge> = HashSet::new();
    let mut reached: HashSet<String> = HashSet::new();
    let mut queue = VecDeque::new();
    for root in roots {
        if reached.insert(root.clone()) {
            queue.push_back((root.clone(), 0usize));
        }
    }

    while let Some((node_id, depth)) = queue.pop_front() {
        let Some(node) = store.node(&node_id)? else {
            continue;
        };
        let wanted = query.node_kinds.is_empty() || query.node_kinds.contains(&node.kind());
        if wanted && (depth > 0 || query.include_roots) {
            result.nodes.insert(node_id.clone(), node);
        }
        if depth >= query.depth || result.truncated {
            continue;
        }

        for edge in incident_edges(store, &node_id, query)? {
            if reported.contains(&edge) {
                continue;
            }
            if result.edges.len() >= query.max_edges {
                result.truncated = true;
                break;
            }
            let next = if edge.source == node_id {
                &edge.target
            } else {
                &edge.source
            };
            if reached.insert(next.clone()) {
                queue.push_back((next.clone(), depth + 1));
            }
            reported.insert(edge.clone());
            result.edges.push(edge);
        }
    }

    Ok(result)
}

fn incident_edges(
    store: &SqliteGraphStore,
    node_id: &str,
    query: &NeighborhoodQuery,
) -> StoreResult<Vec<Edge>> {
    let mut edges = Vec::new();
    if query.direction != TraversalDirection::Incoming {
        edges.extend(store.edges_from(node_id, None)?);
    }
    if query.direction != TraversalDirection::Outgoing {
        edges.extend(store.edges_to(node_id, None)?);
    }
    if !query.edge_kinds.is_empty() {
        edges.retain(|edge| query.edge_kinds.contains(&edge.kind));
    }
    Ok(edges)
}
