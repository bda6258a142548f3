use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::routing::RoutingValue;

use super::interpreter::Interpreter;
use super::model::Graph;
use super::node::NodeHandler;
use crate::context::ExecutionContext;

type MergeFn = Arc<dyn Fn(Vec<(String, RoutingValue)>) -> Result<RoutingValue> + Send + Sync>;

/// Fan-out/fan-in node.
///
/// Every branch graph receives the node's input and runs concurrently on its
/// own forked context. The node waits for all branches; the first failing
/// branch cancels the rest, which wind down before its error becomes the
/// node's error.
pub struct ParallelNode {
    branches: Vec<(String, Arc<Graph>)>,
    merge: Option<MergeFn>,
}

impl ParallelNode {
    /// Kind of the value produced by the default merge.
    pub const MERGED_KIND: &'static str = "parallel";

    pub fn new() -> Self {
        Self {
            branches: vec![],
            merge: None,
        }
    }

    pub fn branch(mut self, name: impl Into<String>, graph: impl Into<Arc<Graph>>) -> Self {
        self.branches.push((name.into(), graph.into()));
        self
    }

    /// Combine branch outputs (in branch declaration order) into the node's output.
    ///
    /// Without a merge function the output is an object mapping branch name to
    /// payload, tagged [`MERGED_KIND`](Self::MERGED_KIND).
    pub fn merge_with(
        mut self,
        f: impl Fn(Vec<(String, RoutingValue)>) -> Result<RoutingValue> + Send + Sync + 'static,
    ) -> Self {
        self.merge = Some(Arc::new(f));
        self
    }

    pub fn branch_names(&self) -> Vec<&str> {
        self.branches.iter().map(|(n, _)| n.as_str()).collect()
    }
}

impl Default for ParallelNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Branch outputs in declaration order, or the error that stopped the node.
///
/// A branch's own failure is preferred over the `Cancelled` it caused in its
/// siblings.
fn collect_branches(
    results: Vec<Result<(String, RoutingValue)>>,
) -> Result<Vec<(String, RoutingValue)>> {
    let mut outputs = Vec::with_capacity(results.len());
    let mut cancelled = None;
    for result in results {
        match result {
            Ok(output) => outputs.push(output),
            Err(WeftError::Cancelled) => cancelled = Some(WeftError::Cancelled),
            Err(e) => return Err(e),
        }
    }
    match cancelled {
        Some(e) => Err(e),
        None => Ok(outputs),
    }
}

fn default_merge(outputs: Vec<(String, RoutingValue)>) -> RoutingValue {
    let merged: serde_json::Map<String, serde_json::Value> = outputs
        .into_iter()
        .map(|(name, value)| (name, value.payload))
        .collect();
    RoutingValue::tagged(ParallelNode::MERGED_KIND, serde_json::Value::Object(merged))
}

impl NodeHandler for ParallelNode {
    fn execute(
        &self,
        ctx: ExecutionContext,
        input: RoutingValue,
    ) -> BoxFuture<'_, Result<RoutingValue>> {
        Box::pin(async move {
            let forks: Vec<ExecutionContext> =
                self.branches.iter().map(|(name, _)| ctx.fork(name)).collect();

            let runs = self.branches.iter().zip(&forks).map(|((name, graph), branch_ctx)| {
                let forks = &forks;
                let input = input.clone();
                async move {
                    let result = Interpreter::walk(graph, branch_ctx, input).await;
                    if result.is_err() {
                        for fork in forks {
                            fork.cancel();
                        }
                    }
                    result.map(|out| (name.clone(), out))
                }
            });

            // Cancelled siblings still run to completion so their nodes close
            // with AfterNode.
            let results = futures::future::join_all(runs).await;
            let outputs = collect_branches(results)?;
            debug!(branches = outputs.len(), "Parallel branches joined");

            match &self.merge {
                Some(merge) => merge(outputs),
                None => Ok(default_merge(outputs)),
            }
        })
    }
}
