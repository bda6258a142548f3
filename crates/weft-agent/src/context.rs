use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use futures::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::storage::{StorageKey, TypedStore};
use weft_core::traits::{ModelCaller, ToolCaller};
use weft_core::types::{
    ModelResponse, ModelSpec, Prompt, RunId, SessionId, StreamDelta, ToolDescriptor, ToolResult,
};

use crate::feature::{FeatureKey, FeatureRegistry};
use crate::graph::RunStatus;
use crate::pipeline::hook::*;
use crate::pipeline::Pipeline;

/// External collaborators reachable from nodes.
#[derive(Clone, Default)]
pub struct Services {
    pub model: Option<Arc<dyn ModelCaller>>,
    pub tools: Option<Arc<dyn ToolCaller>>,
    /// Model used by [`ExecutionContext::call_model_default`].
    pub default_model: Option<ModelSpec>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("model", &self.model.is_some())
            .field("tools", &self.tools.is_some())
            .field("default_model", &self.default_model)
            .finish()
    }
}

struct ContextInner {
    run_id: RunId,
    session_id: SessionId,
    agent_id: String,
    strategy_name: String,
    graph_path: Vec<String>,
    storage: Arc<TypedStore>,
    /// Set on forked contexts: local misses are looked up here.
    read_through: Option<ExecutionContext>,
    parent: Option<ExecutionContext>,
    services: Services,
    pipeline: Arc<Pipeline>,
    features: Arc<FeatureRegistry>,
    cancel: CancellationToken,
    status: Mutex<RunStatus>,
}

/// Per-run state handed to every node, hook and transform.
///
/// A cheap, cloneable handle. One is created for each top-level run; subgraph
/// nodes derive a [`child`](Self::child) that shares the parent's storage, and
/// parallel branches derive a [`fork`](Self::fork) with isolated storage that
/// still reads through to the parent.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl ExecutionContext {
    pub fn builder(strategy_name: impl Into<String>) -> ContextBuilder {
        ContextBuilder::new(strategy_name)
    }

    /// A context with no services, no features and an empty pipeline.
    pub fn detached(strategy_name: impl Into<String>) -> Self {
        Self::builder(strategy_name).build()
    }

    pub fn run_id(&self) -> &RunId {
        &self.inner.run_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn strategy_name(&self) -> &str {
        &self.inner.strategy_name
    }

    /// Name of the graph this context belongs to.
    pub fn graph_name(&self) -> &str {
        self.inner
            .graph_path
            .last()
            .map(String::as_str)
            .unwrap_or(&self.inner.strategy_name)
    }

    /// Graph names from the strategy down to this context, joined by `/`.
    pub fn graph_path(&self) -> String {
        self.inner.graph_path.join("/")
    }

    /// Nesting depth; 0 for a top-level run.
    pub fn depth(&self) -> usize {
        self.inner.graph_path.len().saturating_sub(1)
    }

    pub fn parent(&self) -> Option<&ExecutionContext> {
        self.inner.parent.as_ref()
    }

    // -- storage --

    /// This context's own store, without read-through.
    pub fn storage(&self) -> &TypedStore {
        &self.inner.storage
    }

    /// Look a key up locally, then in the parent store for forked contexts.
    pub fn get<T>(&self, key: &StorageKey<T>) -> Result<Option<T>>
    where
        T: Any + Clone + Send + Sync,
    {
        match self.inner.storage.get(key)? {
            Some(value) => Ok(Some(value)),
            None => match &self.inner.read_through {
                Some(parent) => parent.get(key),
                None => Ok(None),
            },
        }
    }

    pub fn require<T>(&self, key: &StorageKey<T>) -> Result<T>
    where
        T: Any + Clone + Send + Sync,
    {
        self.get(key)?
            .ok_or_else(|| WeftError::StorageKeyMissing(key.name().to_string()))
    }

    /// Store a value in this context's store; returns the previous value.
    pub fn set<T>(&self, key: &StorageKey<T>, value: T) -> Option<T>
    where
        T: Any + Send + Sync,
    {
        self.inner.storage.set(key, value)
    }

    // -- pipeline & features --

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.inner.pipeline
    }

    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    pub fn feature<T: Send + Sync + 'static>(&self, key: &FeatureKey) -> Result<Arc<T>> {
        self.inner.features.get(key)
    }

    // -- lifecycle --

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Request cancellation of this context and everything derived from it.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn status(&self) -> RunStatus {
        *self
            .inner
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_status(&self, status: RunStatus) {
        *self
            .inner
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }

    /// Context for a nested subgraph run. Storage, services and the
    /// cancellation token are shared with `self`.
    pub fn child(&self, graph_name: &str) -> ExecutionContext {
        self.derive(graph_name, self.inner.storage.clone(), None, self.inner.cancel.clone())
    }

    /// Context for one branch of a parallel node. Writes stay local to the
    /// branch; reads fall back to `self`. Cancelling the branch does not
    /// cancel `self`, but cancelling `self` cancels the branch.
    pub fn fork(&self, branch: &str) -> ExecutionContext {
        self.derive(
            branch,
            Arc::new(TypedStore::new()),
            Some(self.clone()),
            self.inner.cancel.child_token(),
        )
    }

    fn derive(
        &self,
        name: &str,
        storage: Arc<TypedStore>,
        read_through: Option<ExecutionContext>,
        cancel: CancellationToken,
    ) -> ExecutionContext {
        let mut graph_path = self.inner.graph_path.clone();
        graph_path.push(name.to_string());
        ExecutionContext {
            inner: Arc::new(ContextInner {
                run_id: self.inner.run_id.clone(),
                session_id: self.inner.session_id.clone(),
                agent_id: self.inner.agent_id.clone(),
                strategy_name: self.inner.strategy_name.clone(),
                graph_path,
                storage,
                read_through,
                parent: Some(self.clone()),
                services: self.inner.services.clone(),
                pipeline: self.inner.pipeline.clone(),
                features: self.inner.features.clone(),
                cancel,
                status: Mutex::new(RunStatus::Running),
            }),
        }
    }

    // -- model calls --

    /// Call the model service, firing `BeforeModelCall` and `AfterModelCall`.
    ///
    /// `AfterModelCall` carries responses, so it fires only on success. A
    /// failed or cancelled call surfaces through the node's `AfterNode`
    /// outcome instead.
    pub async fn call_model(
        &self,
        prompt: &Prompt,
        tools: &[ToolDescriptor],
        model: &ModelSpec,
    ) -> Result<Vec<ModelResponse>> {
        let caller = self
            .inner
            .services
            .model
            .clone()
            .ok_or(WeftError::ModelUnavailable)?;

        self.pipeline()
            .fire(HookEvent::BeforeModelCall(ModelCallStartEvent {
                ctx: self.clone(),
                prompt: prompt.clone(),
                tools: tools.to_vec(),
                model: model.clone(),
                session_id: self.session_id().clone(),
            }))
            .await?;

        debug!(run_id = %self.run_id(), model = %model, prompt = %prompt.id, "Model call");
        let responses = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => return Err(WeftError::Cancelled),
            r = caller.call(prompt, tools, model) => r?,
        };

        self.pipeline()
            .fire(HookEvent::AfterModelCall(ModelCallFinishEvent {
                ctx: self.clone(),
                prompt: prompt.clone(),
                tools: tools.to_vec(),
                model: model.clone(),
                session_id: self.session_id().clone(),
                responses: responses.clone(),
            }))
            .await?;
        Ok(responses)
    }

    /// [`call_model`](Self::call_model) with the configured default model and
    /// every tool the tool service offers.
    pub async fn call_model_default(&self, prompt: &Prompt) -> Result<Vec<ModelResponse>> {
        let model = self
            .inner
            .services
            .default_model
            .clone()
            .ok_or_else(|| WeftError::Config("no default model configured".into()))?;
        let tools = self.tools();
        self.call_model(prompt, &tools, &model).await
    }

    /// Open a streaming model call. Only `BeforeModelCall` fires; the stream
    /// ends early if the run is cancelled.
    pub async fn call_model_streaming(
        &self,
        prompt: &Prompt,
        model: &ModelSpec,
    ) -> Result<BoxStream<'static, Result<StreamDelta>>> {
        let caller = self
            .inner
            .services
            .model
            .clone()
            .ok_or(WeftError::ModelUnavailable)?;

        self.pipeline()
            .fire(HookEvent::BeforeModelCall(ModelCallStartEvent {
                ctx: self.clone(),
                prompt: prompt.clone(),
                tools: vec![],
                model: model.clone(),
                session_id: self.session_id().clone(),
            }))
            .await?;

        let stream = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => return Err(WeftError::Cancelled),
            r = caller.call_streaming(prompt, model) => r?,
        };
        Ok(stream
            .take_until(self.inner.cancel.clone().cancelled_owned())
            .boxed())
    }

    // -- tool calls --

    /// Tools offered by the tool service; empty without one.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.inner
            .services
            .tools
            .as_ref()
            .map(|t| t.descriptors())
            .unwrap_or_default()
    }

    /// Execute a tool, firing `ToolCall` before and exactly one of
    /// `ToolCallResult`, `ToolValidationError` or `ToolCallFailure` after.
    /// Cancellation while the tool runs reports as `ToolCallFailure`.
    pub async fn call_tool(
        &self,
        tool: &ToolDescriptor,
        args: serde_json::Value,
    ) -> Result<ToolResult> {
        let caller = self
            .inner
            .services
            .tools
            .clone()
            .ok_or(WeftError::ToolUnavailable)?;

        self.pipeline()
            .fire(HookEvent::ToolCall(ToolCallEvent {
                ctx: self.clone(),
                tool: tool.clone(),
                args: args.clone(),
            }))
            .await?;

        debug!(run_id = %self.run_id(), tool = %tool.name, "Tool call");
        let result = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(WeftError::Cancelled),
            r = caller.execute(tool, args.clone()) => r,
        };

        match result {
            Ok(result) => {
                self.pipeline()
                    .fire(HookEvent::ToolCallResult(ToolCallResultEvent {
                        ctx: self.clone(),
                        tool: tool.clone(),
                        args,
                        result: result.clone(),
                    }))
                    .await?;
                Ok(result)
            }
            Err(e @ WeftError::ToolValidation { .. }) => {
                self.pipeline()
                    .fire(HookEvent::ToolValidationError(ToolValidationErrorEvent {
                        ctx: self.clone(),
                        tool: tool.clone(),
                        args,
                        error: e.to_string(),
                    }))
                    .await?;
                Err(e)
            }
            Err(e) => {
                self.pipeline()
                    .fire(HookEvent::ToolCallFailure(ToolCallFailureEvent {
                        ctx: self.clone(),
                        tool: tool.clone(),
                        args,
                        error: e.to_string(),
                    }))
                    .await?;
                Err(e)
            }
        }
    }

    /// Look a tool up by name and execute it.
    pub async fn call_tool_named(&self, name: &str, args: serde_json::Value) -> Result<ToolResult> {
        if self.inner.services.tools.is_none() {
            return Err(WeftError::ToolUnavailable);
        }
        let tool = self
            .tools()
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| WeftError::ToolNotFound(name.to_string()))?;
        self.call_tool(&tool, args).await
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.inner.run_id)
            .field("agent_id", &self.inner.agent_id)
            .field("graph_path", &self.inner.graph_path)
            .field("status", &self.status())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Assembles a top-level [`ExecutionContext`].
pub struct ContextBuilder {
    strategy_name: String,
    agent_id: String,
    session_id: Option<SessionId>,
    services: Services,
    pipeline: Option<Arc<Pipeline>>,
    features: Option<Arc<FeatureRegistry>>,
    cancel: Option<CancellationToken>,
}

impl ContextBuilder {
    fn new(strategy_name: impl Into<String>) -> Self {
        Self {
            strategy_name: strategy_name.into(),
            agent_id: "weft-agent".to_string(),
            session_id: None,
            services: Services::default(),
            pipeline: None,
            features: None,
            cancel: None,
        }
    }

    pub fn agent_id(mut self, id: impl Into<String>) -> Self {
        self.agent_id = id.into();
        self
    }

    pub fn session_id(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    pub fn pipeline(mut self, pipeline: Arc<Pipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn features(mut self, features: Arc<FeatureRegistry>) -> Self {
        self.features = Some(features);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> ExecutionContext {
        let strategy_name = self.strategy_name;
        ExecutionContext {
            inner: Arc::new(ContextInner {
                run_id: RunId::new(),
                session_id: self.session_id.unwrap_or_default(),
                agent_id: self.agent_id,
                graph_path: vec![strategy_name.clone()],
                strategy_name,
                storage: Arc::new(TypedStore::new()),
                read_through: None,
                parent: None,
                services: self.services,
                pipeline: self.pipeline.unwrap_or_default(),
                features: self.features.unwrap_or_default(),
                cancel: self.cancel.unwrap_or_default(),
                status: Mutex::new(RunStatus::Idle),
            }),
        }
    }
}
