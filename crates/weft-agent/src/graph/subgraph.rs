use std::sync::Arc;

use futures::future::BoxFuture;

use weft_core::error::Result;
use weft_core::routing::RoutingValue;

use super::interpreter::Interpreter;
use super::model::Graph;
use super::node::NodeHandler;
use crate::context::ExecutionContext;

/// A built graph used as a node of another graph.
///
/// Each invocation walks the nested graph on a child context; the nested
/// finish node's output becomes this node's output.
pub struct SubgraphNode {
    graph: Arc<Graph>,
}

impl SubgraphNode {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

impl NodeHandler for SubgraphNode {
    fn execute(
        &self,
        ctx: ExecutionContext,
        input: RoutingValue,
    ) -> BoxFuture<'_, Result<RoutingValue>> {
        Box::pin(async move {
            let child = ctx.child(self.graph.name());
            Interpreter::walk(&self.graph, &child, input).await
        })
    }
}
