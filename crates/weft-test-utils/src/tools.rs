use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use weft_core::error::{Result, WeftError};
use weft_core::traits::ToolCaller;
use weft_core::types::{ToolDescriptor, ToolResult};

type Handler = Arc<dyn Fn(serde_json::Value) -> Result<ToolResult> + Send + Sync>;

/// One execution seen by [`MockToolCaller`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedToolCall {
    pub tool: String,
    pub args: serde_json::Value,
}

/// Tool service backed by in-process closures.
#[derive(Default)]
pub struct MockToolCaller {
    tools: Vec<(ToolDescriptor, Handler)>,
    calls: Mutex<Vec<RecordedToolCall>>,
    delay: Option<Duration>,
}

impl MockToolCaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(
        mut self,
        descriptor: ToolDescriptor,
        handler: impl Fn(serde_json::Value) -> Result<ToolResult> + Send + Sync + 'static,
    ) -> Self {
        self.tools.push((descriptor, Arc::new(handler)));
        self
    }

    /// A tool that echoes its `text` argument, rejecting calls without one.
    pub fn with_echo(self) -> Self {
        self.with_tool(ToolDescriptor::new("echo", "Echo the text argument"), |args| {
            match args.get("text").and_then(|t| t.as_str()) {
                Some(text) => Ok(ToolResult::success(text)),
                None => Err(WeftError::ToolValidation {
                    tool: "echo".into(),
                    message: "missing 'text'".into(),
                }),
            }
        })
    }

    /// A tool that always fails with `ToolExecution`.
    pub fn with_failing(self, name: &str) -> Self {
        let tool = name.to_string();
        self.with_tool(ToolDescriptor::new(name, "Always fails"), move |_args| {
            Err(WeftError::ToolExecution {
                tool: tool.clone(),
                message: "scripted failure".into(),
            })
        })
    }

    /// Sleep this long before running each tool.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedToolCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl ToolCaller for MockToolCaller {
    fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|(d, _)| d.clone()).collect()
    }

    fn execute(
        &self,
        tool: &ToolDescriptor,
        args: serde_json::Value,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        let name = tool.name.clone();
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().unwrap().push(RecordedToolCall {
                tool: name.clone(),
                args: args.clone(),
            });
            let handler = self
                .tools
                .iter()
                .find(|(d, _)| d.name == name)
                .map(|(_, h)| h.clone())
                .ok_or_else(|| WeftError::ToolNotFound(name.clone()))?;
            handler(args)
        })
    }
}
