#![forbid(unsafe_code)]

//! Graph Upsert Engine: batched merge-by-identity writes.
//!
//! Nodes are chunked in resolution order. Each edge rides in the batch
//! that completes its second endpoint, so by the time an edge is written
//! both of its nodes are already committed or part of the same
//! transaction.

use std::collections::HashMap;

use tracing::{debug, error, warn};

use crate::config::PipelineConfig;
use crate::db::GraphStore;
use crate::pipeline::{CancellationToken, RunPhase, RunProgress};
use crate::retry::RetryPolicy;
use crate::types::{Edge, Node, RunError};

/// One transaction worth of work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch<'a> {
    pub nodes: Vec<&'a Node>,
    pub edges: Vec<&'a Edge>,
}

impl Batch<'_> {
    fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    fn unwritten(&self) -> impl Iterator<Item = String> + '_ {
        self.nodes
            .iter()
            .map(|node| format!("{} {}", node.kind(), node.qualified_name))
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    pub batches_written: usize,
    pub nodes_created: usize,
    pub nodes_updated: usize,
    pub edges_created: usize,
    /// Edges whose endpoints are not part of the write set.
    pub skipped_edges: usize,
    pub errors: Vec<RunError>,
    pub cancelled: bool,
}

impl WriteReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }
}

#[derive(Debug, Clone)]
pub struct UpsertEngine {
    batch_size: usize,
    retry: RetryPolicy,
}

impl UpsertEngine {
    pub fn new(batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            batch_size: batch_size.max(1),
            retry,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.batch_size, RetryPolicy::for_write(config))
    }

    /// Splits the write set into batches of at most `batch_size` nodes and
    /// `batch_size` edges. Edges referencing a node outside `nodes` are
    /// returned separately and never written.
    pub fn plan<'a>(&self, nodes: &'a [Node], edges: &'a [Edge]) -> (Vec<Batch<'a>>, usize) {
        let mut slot: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        let mut node_chunks: Vec<Vec<&Node>> = Vec::new();
        for (idx, chunk) in nodes.chunks(self.batch_size).enumerate() {
            for node in chunk {
                slot.insert(node.id.as_str(), idx);
            }
            node_chunks.push(chunk.iter().collect());
        }

        let mut edge_slots: Vec<Vec<&Edge>> = vec![Vec::new(); node_chunks.len()];
        let mut skipped = 0;
        for edge in edges {
            match (slot.get(edge.source.as_str()), slot.get(edge.target.as_str())) {
                (Some(&a), Some(&b)) => edge_slots[a.max(b)].push(edge),
                _ => skipped += 1,
            }
        }

        let mut batches = Vec::new();
        for (nodes, edges) in node_chunks.into_iter().zip(edge_slots) {
            let mut chunks = edges.chunks(self.batch_size);
            let first = chunks.next().map(|chunk| chunk.to_vec()).unwrap_or_default();
            batches.push(Batch {
                nodes,
                edges: first,
            });
            for overflow in chunks {
                batches.push(Batch {
                    nodes: Vec::new(),
                    edges: overflow.to_vec(),
                });
            }
        }
        batches.retain(|batch| !batch.is_empty());
        (batches, skipped)
    }

    /// Writes every batch in order. Stops at the first batch that still
    /// fails after retries, or when `cancel` fires between batches; the
    /// report then lists every entity that did not reach the store.
    pub fn write(
        &self,
        store: &mut dyn GraphStore,
        nodes: &[Node],
        edges: &[Edge],
        cancel: &CancellationToken,
        on_progress: Option<&(dyn Fn(RunProgress) + Sync)>,
    ) -> WriteReport {
        let (batches, skipped) = self.plan(nodes, edges);
        let mut report = WriteReport {
            skipped_edges: skipped,
            ..WriteReport::default()
        };
        if skipped > 0 {
            warn!(count = skipped, "edges reference nodes outside the write set");
        }
        debug!(batches = batches.len(), store = %store.describe(), "writing graph");

        for (idx, batch) in batches.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                debug!(batch = idx, "cancelled before batch");
                break;
            }
            if let Some(cb) = on_progress {
                cb(RunProgress {
                    phase: RunPhase::Writing,
                    current: idx + 1,
                    total: batches.len(),
                    current_file: None,
                });
            }

            let owned_nodes: Vec<Node> = batch.nodes.iter().map(|n| (*n).clone()).collect();
            let owned_edges: Vec<Edge> = batch.edges.iter().map(|e| (*e).clone()).collect();
            let result = self.retry.run(
                |_| store.upsert_batch(&owned_nodes, &owned_edges),
                |_| Some(None),
                |attempt, delay, err| {
                    warn!(
                        batch = idx,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying write batch"
                    );
                },
            );

            match result {
                Ok(stats) => {
                    report.batches_written += 1;
                    report.nodes_created += stats.nodes_created;
                    report.nodes_updated += stats.nodes_updated;
                    report.edges_created += stats.edges_created;
                }
                Err(err) => {
                    let unwritten: Vec<String> = batches[idx..]
                        .iter()
                        .flat_map(|batch| batch.unwritten())
                        .collect();
                    error!(
                        batch = idx,
                        unwritten = unwritten.len(),
                        error = %err,
                        "write batch failed after retries"
                    );
                    report.errors.push(RunError::WriteError {
                        batch: idx,
                        message: err.to_string(),
                        unwritten,
                    });
                    break;
                }
            }
        }
        report
    }
}
