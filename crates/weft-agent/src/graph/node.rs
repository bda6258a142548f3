use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use weft_core::error::Result;
use weft_core::routing::RoutingValue;

use crate::context::ExecutionContext;

/// The body of a node.
///
/// `execute` may suspend on external calls; it receives a handle to the run's
/// context and the value routed into the node.
pub trait NodeHandler: Send + Sync + 'static {
    fn execute(
        &self,
        ctx: ExecutionContext,
        input: RoutingValue,
    ) -> BoxFuture<'_, Result<RoutingValue>>;
}

/// What a node is, for logs and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Task,
    Passthrough,
    Subgraph,
    Parallel,
}

/// A node in a built graph.
#[derive(Clone)]
pub struct Node {
    pub(crate) id: String,
    pub(crate) kind: NodeKind,
    pub(crate) handler: Arc<dyn NodeHandler>,
}

impl Node {
    pub(crate) fn new(id: impl Into<String>, kind: NodeKind, handler: Arc<dyn NodeHandler>) -> Self {
        Self {
            id: id.into(),
            kind,
            handler,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub(crate) fn handler(&self) -> &Arc<dyn NodeHandler> {
        &self.handler
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Adapts an async closure over routing values into a node.
pub struct FnNode<F> {
    f: F,
}

impl<F> FnNode<F> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(ExecutionContext, RoutingValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RoutingValue>> + Send + 'static,
    {
        Self { f }
    }
}

impl<F, Fut> NodeHandler for FnNode<F>
where
    F: Fn(ExecutionContext, RoutingValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RoutingValue>> + Send + 'static,
{
    fn execute(
        &self,
        ctx: ExecutionContext,
        input: RoutingValue,
    ) -> BoxFuture<'_, Result<RoutingValue>> {
        Box::pin((self.f)(ctx, input))
    }
}

/// Adapts an async closure over concrete types into a node.
///
/// The input payload is deserialized into `I`; the returned `O` is serialized
/// under the default kind. A payload of the wrong shape fails the node.
pub struct TypedNode<I, O, F> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O, F> TypedNode<I, O, F> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(ExecutionContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        Self {
            f,
            _types: PhantomData,
        }
    }
}

impl<I, O, F, Fut> NodeHandler for TypedNode<I, O, F>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(ExecutionContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    fn execute(
        &self,
        ctx: ExecutionContext,
        input: RoutingValue,
    ) -> BoxFuture<'_, Result<RoutingValue>> {
        let typed = input.payload_as::<I>();
        Box::pin(async move {
            let output = (self.f)(ctx, typed?).await?;
            RoutingValue::from_typed(&output)
        })
    }
}

/// Forwards its input unchanged. Typical for start and finish nodes.
pub struct Passthrough;

impl NodeHandler for Passthrough {
    fn execute(
        &self,
        _ctx: ExecutionContext,
        input: RoutingValue,
    ) -> BoxFuture<'_, Result<RoutingValue>> {
        Box::pin(async move { Ok(input) })
    }
}
