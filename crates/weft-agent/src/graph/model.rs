use std::collections::HashMap;

use weft_core::routing::RoutingValue;

use super::edge::Edge;
use super::node::Node;

/// A built, immutable execution graph.
///
/// At the top level of an agent this is its strategy; nested inside another
/// graph it is a subgraph. Only [`GraphBuilder`](super::GraphBuilder) creates
/// one, so `start`, `finish` and every edge endpoint are known to exist.
#[derive(Debug)]
pub struct Graph {
    pub(crate) name: String,
    pub(crate) nodes: HashMap<String, Node>,
    pub(crate) edges_by_source: HashMap<String, Vec<Edge>>,
    pub(crate) start: String,
    pub(crate) finish: String,
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn finish(&self) -> &str {
        &self.finish
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Node ids, sorted.
    pub fn node_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges_by_source.values().map(Vec::len).sum()
    }

    /// Outgoing edges of a node in declaration order.
    pub fn outgoing(&self, id: &str) -> &[Edge] {
        self.edges_by_source
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First outgoing edge whose guard accepts `output`.
    pub fn select_edge(&self, from: &str, output: &RoutingValue) -> Option<&Edge> {
        self.outgoing(from).iter().find(|e| e.guard.matches(output))
    }
}
