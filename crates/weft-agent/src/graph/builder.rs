use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use weft_core::error::{GraphDefinitionError, Result};
use weft_core::routing::RoutingValue;

use super::edge::{Edge, EdgeDef};
use super::model::Graph;
use super::node::{FnNode, Node, NodeHandler, NodeKind, Passthrough, TypedNode};
use super::parallel::ParallelNode;
use super::subgraph::SubgraphNode;
use crate::context::ExecutionContext;

/// Opaque handle to a node, used to wire edges and designate start/finish.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    id: String,
}

impl NodeRef {
    /// Refer to a node by id without having added it through this builder.
    pub fn named(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Handle to a declared edge; `index` is its declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeRef {
    index: usize,
}

impl EdgeRef {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Accumulates nodes and edges, then validates and freezes them into a [`Graph`].
///
/// Structural problems are collected as they happen and reported together by
/// [`build`](Self::build), so wiring calls never fail individually.
pub struct GraphBuilder {
    name: String,
    nodes: Vec<Node>,
    ids: HashSet<String>,
    duplicates: Vec<String>,
    edges: Vec<EdgeDef>,
    start: Option<NodeRef>,
    finish: Option<NodeRef>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: vec![],
            ids: HashSet::new(),
            duplicates: vec![],
            edges: vec![],
            start: None,
            finish: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a node with an arbitrary handler.
    pub fn add_node(&mut self, id: impl Into<String>, handler: impl NodeHandler) -> NodeRef {
        self.push_node(id.into(), NodeKind::Task, Arc::new(handler))
    }

    /// Add a node from an async closure over routing values.
    pub fn add_fn_node<F, Fut>(&mut self, id: impl Into<String>, f: F) -> NodeRef
    where
        F: Fn(ExecutionContext, RoutingValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RoutingValue>> + Send + 'static,
    {
        self.add_node(id, FnNode::new(f))
    }

    /// Add a node from an async closure over concrete input/output types.
    pub fn add_typed_node<I, O, F, Fut>(&mut self, id: impl Into<String>, f: F) -> NodeRef
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(ExecutionContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        self.add_node(id, TypedNode::new(f))
    }

    /// Add a node that forwards its input unchanged.
    pub fn add_passthrough(&mut self, id: impl Into<String>) -> NodeRef {
        self.push_node(id.into(), NodeKind::Passthrough, Arc::new(Passthrough))
    }

    /// Embed a built graph as a single node. Its start and finish stay private.
    pub fn add_subgraph(&mut self, id: impl Into<String>, graph: impl Into<Arc<Graph>>) -> NodeRef {
        self.push_node(
            id.into(),
            NodeKind::Subgraph,
            Arc::new(SubgraphNode::new(graph.into())),
        )
    }

    /// Add a fan-out/fan-in node running its branches concurrently.
    pub fn add_parallel(&mut self, id: impl Into<String>, node: ParallelNode) -> NodeRef {
        self.push_node(id.into(), NodeKind::Parallel, Arc::new(node))
    }

    /// Declare an edge. Declaration order decides which guard wins.
    pub fn add_edge(&mut self, edge: EdgeDef) -> EdgeRef {
        self.edges.push(edge);
        EdgeRef {
            index: self.edges.len() - 1,
        }
    }

    /// Declare an unconditional edge.
    pub fn edge(&mut self, from: &NodeRef, to: &NodeRef) -> EdgeRef {
        self.add_edge(EdgeDef::always(from, to))
    }

    pub fn set_start(&mut self, node: &NodeRef) {
        self.start = Some(node.clone());
    }

    pub fn set_finish(&mut self, node: &NodeRef) {
        self.finish = Some(node.clone());
    }

    /// Validate and freeze.
    pub fn build(self) -> std::result::Result<Graph, GraphDefinitionError> {
        let mut problems = Vec::new();

        for id in &self.duplicates {
            problems.push(GraphDefinitionError::DuplicateNodeId {
                graph: self.name.clone(),
                id: id.clone(),
            });
        }

        for (role, node) in [("start", &self.start), ("finish", &self.finish)] {
            match node {
                None => problems.push(GraphDefinitionError::MissingStartOrFinish {
                    graph: self.name.clone(),
                    missing: role.to_string(),
                }),
                Some(r) if !self.ids.contains(r.id()) => {
                    problems.push(GraphDefinitionError::UnknownNodeReference {
                        graph: self.name.clone(),
                        id: r.id().to_string(),
                        context: role.to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        for (i, edge) in self.edges.iter().enumerate() {
            for (end, r) in [("from", &edge.from), ("to", &edge.to)] {
                if !self.ids.contains(r.id()) {
                    problems.push(GraphDefinitionError::UnknownNodeReference {
                        graph: self.name.clone(),
                        id: r.id().to_string(),
                        context: format!("edge #{} ({})", i, end),
                    });
                }
            }
        }

        if problems.len() == 1 {
            return Err(problems.remove(0));
        }
        if !problems.is_empty() {
            return Err(GraphDefinitionError::Multiple(problems));
        }

        // Both are present once validation passed.
        let (Some(start), Some(finish)) = (self.start, self.finish) else {
            unreachable!("start and finish validated above");
        };

        let mut edges_by_source: HashMap<String, Vec<Edge>> = HashMap::new();
        for (order, def) in self.edges.into_iter().enumerate() {
            edges_by_source
                .entry(def.from.id().to_string())
                .or_default()
                .push(Edge {
                    from: def.from.id().to_string(),
                    to: def.to.id().to_string(),
                    guard: def.guard,
                    transform: def.transform,
                    order,
                });
        }

        let graph = Graph {
            name: self.name,
            nodes: self
                .nodes
                .into_iter()
                .map(|n| (n.id.clone(), n))
                .collect(),
            edges_by_source,
            start: start.id,
            finish: finish.id,
        };

        for node in dead_ends(&graph) {
            warn!(
                graph = %graph.name,
                node = %node,
                "Reachable node has no outgoing edges; runs reaching it will fail with NoRoute"
            );
        }

        debug!(
            graph = %graph.name,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "Graph built"
        );
        Ok(graph)
    }

    fn push_node(&mut self, id: String, kind: NodeKind, handler: Arc<dyn NodeHandler>) -> NodeRef {
        if !self.ids.insert(id.clone()) {
            // The first declaration wins; the duplicate is reported at build time.
            self.duplicates.push(id.clone());
        } else {
            self.nodes.push(Node::new(id.clone(), kind, handler));
        }
        NodeRef { id }
    }
}

/// Non-finish nodes reachable from start that have no outgoing edge.
fn dead_ends(graph: &Graph) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([graph.start.clone()]);
    let mut stuck = Vec::new();

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let outgoing = graph.outgoing(&id);
        if outgoing.is_empty() && id != graph.finish {
            stuck.push(id.clone());
        }
        queue.extend(outgoing.iter().map(|e| e.to.clone()));
    }
    stuck.sort();
    stuck
}
