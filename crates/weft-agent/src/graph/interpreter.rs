use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, info};

use weft_core::error::{Result, WeftError};
use weft_core::routing::RoutingValue;

use super::model::Graph;
use super::node::{Node, NodeKind};
use crate::context::ExecutionContext;
use crate::pipeline::hook::*;
use crate::pipeline::panic_message;

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Walks a built graph for one run.
///
/// The interpreter holds no per-run state: the same instance (and the same
/// graph) may drive any number of concurrent runs, each with its own
/// [`ExecutionContext`].
#[derive(Debug, Clone)]
pub struct Interpreter {
    graph: Arc<Graph>,
}

impl Interpreter {
    pub fn new(graph: impl Into<Arc<Graph>>) -> Self {
        Self {
            graph: graph.into(),
        }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Run the graph as a top-level strategy.
    ///
    /// Fires the agent and strategy lifecycle hooks around the walk. On any
    /// terminal failure `AgentRunError` fires exactly once before the error is
    /// returned.
    pub async fn run(&self, ctx: &ExecutionContext, input: RoutingValue) -> Result<RoutingValue> {
        let start = Instant::now();
        let graph = self.graph.as_ref();
        let pipeline = ctx.pipeline().clone();
        ctx.set_status(RunStatus::Running);

        info!(
            run_id = %ctx.run_id(),
            agent_id = %ctx.agent_id(),
            strategy = %graph.name(),
            "Agent run started"
        );

        let result = async {
            pipeline
                .fire(HookEvent::BeforeAgentStarted(AgentStartingEvent {
                    ctx: ctx.clone(),
                    agent_id: ctx.agent_id().to_string(),
                    strategy: graph.name().to_string(),
                    input: input.clone(),
                }))
                .await?;
            pipeline
                .fire(HookEvent::StrategyStarted(StrategyStartedEvent {
                    ctx: ctx.clone(),
                    strategy: graph.name().to_string(),
                }))
                .await?;

            let output = Self::walk(graph, ctx, input).await?;

            pipeline
                .fire(HookEvent::StrategyFinished(StrategyFinishedEvent {
                    ctx: ctx.clone(),
                    strategy: graph.name().to_string(),
                    result: output.clone(),
                }))
                .await?;
            pipeline
                .fire(HookEvent::AgentFinished(AgentFinishedEvent {
                    ctx: ctx.clone(),
                    strategy: graph.name().to_string(),
                    result: output.clone(),
                }))
                .await?;
            Ok::<_, WeftError>(output)
        }
        .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(output) => {
                ctx.set_status(RunStatus::Completed);
                info!(run_id = %ctx.run_id(), elapsed_ms, "Agent run completed");
                Ok(output)
            }
            Err(e) => {
                let status = if matches!(e, WeftError::Cancelled) {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                ctx.set_status(status);
                error!(
                    run_id = %ctx.run_id(),
                    kind = %e.kind(),
                    error = %e,
                    elapsed_ms,
                    "Agent run failed"
                );
                pipeline
                    .fire_run_error(HookEvent::AgentRunError(AgentRunErrorEvent {
                        ctx: ctx.clone(),
                        strategy: graph.name().to_string(),
                        session_id: ctx.session_id().clone(),
                        kind: e.kind(),
                        message: e.to_string(),
                    }))
                    .await;
                Err(e)
            }
        }
    }

    /// Walk `graph` from its start node to its finish node.
    ///
    /// Used for the top-level strategy and, recursively, for subgraph and
    /// parallel nodes. Fires node hooks only.
    pub(crate) fn walk<'a>(
        graph: &'a Graph,
        ctx: &'a ExecutionContext,
        input: RoutingValue,
    ) -> BoxFuture<'a, Result<RoutingValue>> {
        Box::pin(async move {
            let pipeline = ctx.pipeline();
            let mut current = graph.start().to_string();
            let mut value = input;

            loop {
                let node = graph.node(&current).ok_or_else(|| {
                    WeftError::node(format!("node '{}' missing from graph '{}'", current, graph.name()))
                })?;

                if ctx.is_cancelled() {
                    debug!(graph = %graph.name(), node = %current, "Cancelled before node");
                    return Err(WeftError::Cancelled);
                }

                debug!(graph = %graph.name(), node = %current, kind = %value.kind, "Entering node");
                pipeline
                    .fire(HookEvent::BeforeNode(NodeStartEvent {
                        ctx: ctx.clone(),
                        graph: graph.name().to_string(),
                        node: current.clone(),
                        input: value.clone(),
                    }))
                    .await?;

                let result = execute_node(node, ctx, value.clone()).await;

                let outcome = match &result {
                    Ok(output) => NodeOutcome::Completed(output.clone()),
                    Err(WeftError::Cancelled) => NodeOutcome::Cancelled,
                    Err(e) => NodeOutcome::Failed {
                        kind: e.kind(),
                        message: e.to_string(),
                    },
                };
                let after = pipeline
                    .fire(HookEvent::AfterNode(NodeFinishEvent {
                        ctx: ctx.clone(),
                        graph: graph.name().to_string(),
                        node: current.clone(),
                        input: value,
                        outcome,
                    }))
                    .await;

                let output = match result {
                    Ok(output) => output,
                    // The node's own failure wins over a failing AfterNode hook.
                    Err(e) => return Err(wrap_node_error(graph, &current, e)),
                };
                after?;

                if current == graph.finish() {
                    debug!(graph = %graph.name(), node = %current, "Finish node reached");
                    return Ok(output);
                }

                let edge = graph.select_edge(&current, &output).ok_or_else(|| {
                    WeftError::NoRoute {
                        graph: graph.name().to_string(),
                        node: current.clone(),
                        kind: output.kind.clone(),
                    }
                })?;

                debug!(
                    graph = %graph.name(),
                    from = %edge.from,
                    to = %edge.to,
                    edge = edge.order,
                    "Edge selected"
                );

                value = edge
                    .transform
                    .apply(output, ctx)
                    .map_err(|e| wrap_node_error(graph, &current, e))?;
                current = edge.to.clone();
            }
        })
    }
}

/// Run a node body, observing cancellation while it is suspended.
///
/// Subgraph and parallel nodes are awaited to completion: their nested walks
/// watch the same token and close every inner node with `AfterNode`. Task
/// bodies are polled before the token so a context call that sees the
/// cancellation can report it before the body is dropped.
async fn execute_node(node: &Node, ctx: &ExecutionContext, input: RoutingValue) -> Result<RoutingValue> {
    let body = AssertUnwindSafe(node.handler().execute(ctx.clone(), input)).catch_unwind();
    let result = match node.kind() {
        NodeKind::Subgraph | NodeKind::Parallel => body.await,
        NodeKind::Task | NodeKind::Passthrough => {
            tokio::select! {
                biased;
                result = body => result,
                _ = ctx.cancel_token().cancelled() => return Err(WeftError::Cancelled),
            }
        }
    };
    match result {
        Ok(result) => result,
        Err(panic) => Err(WeftError::node(format!(
            "node panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn wrap_node_error(graph: &Graph, node: &str, e: WeftError) -> WeftError {
    if e.is_run_terminal() {
        e
    } else {
        WeftError::NodeExecution {
            graph: graph.name().to_string(),
            node: node.to_string(),
            source: Box::new(e),
        }
    }
}
