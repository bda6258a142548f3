use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::*;

/// Model-call service: the boundary to whatever performs inference.
pub trait ModelCaller: Send + Sync + 'static {
    /// Send a prompt (with the tools the model may call) and collect the answer.
    fn call(
        &self,
        prompt: &Prompt,
        tools: &[ToolDescriptor],
        model: &ModelSpec,
    ) -> BoxFuture<'_, Result<Vec<ModelResponse>>>;

    /// Send a prompt and receive a stream of deltas.
    fn call_streaming(
        &self,
        prompt: &Prompt,
        model: &ModelSpec,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<StreamDelta>>>>;
}

/// Tool-execution service. Resolves a descriptor to an implementation and runs it.
pub trait ToolCaller: Send + Sync + 'static {
    /// Tools this service can run.
    fn descriptors(&self) -> Vec<ToolDescriptor>;

    /// Execute a tool. Argument problems are reported as
    /// `WeftError::ToolValidation`, everything else as other errors.
    fn execute(
        &self,
        tool: &ToolDescriptor,
        args: serde_json::Value,
    ) -> BoxFuture<'_, Result<ToolResult>>;
}
