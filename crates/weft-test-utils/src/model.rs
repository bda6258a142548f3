use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};

use weft_core::error::{Result, WeftError};
use weft_core::traits::ModelCaller;
use weft_core::types::{ModelResponse, ModelSpec, Prompt, StreamDelta, ToolDescriptor};

/// One request seen by [`MockModelCaller`].
#[derive(Debug, Clone)]
pub struct RecordedModelCall {
    pub prompt: Prompt,
    pub tools: Vec<String>,
    pub model: ModelSpec,
    pub streaming: bool,
}

/// Model service that replays a script of answers in order.
///
/// Each call consumes one scripted entry; an exhausted script fails the call
/// with `ModelCall`.
pub struct MockModelCaller {
    script: Mutex<VecDeque<Result<Vec<ModelResponse>>>>,
    calls: Mutex<Vec<RecordedModelCall>>,
    delay: Option<Duration>,
}

impl MockModelCaller {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Answer the next call with a single assistant message.
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_responses(vec![ModelResponse::text(text)])
    }

    pub fn with_responses(self, responses: Vec<ModelResponse>) -> Self {
        self.script.lock().unwrap().push_back(Ok(responses));
        self
    }

    /// Fail the next call.
    pub fn with_error(self, message: impl Into<String>) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(WeftError::ModelCall(message.into())));
        self
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedModelCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next(&self, record: RecordedModelCall) -> Result<Vec<ModelResponse>> {
        self.calls.lock().unwrap().push(record);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(WeftError::ModelCall("mock script exhausted".into())))
    }
}

impl Default for MockModelCaller {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelCaller for MockModelCaller {
    fn call(
        &self,
        prompt: &Prompt,
        tools: &[ToolDescriptor],
        model: &ModelSpec,
    ) -> BoxFuture<'_, Result<Vec<ModelResponse>>> {
        let record = RecordedModelCall {
            prompt: prompt.clone(),
            tools: tools.iter().map(|t| t.name.clone()).collect(),
            model: model.clone(),
            streaming: false,
        };
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.next(record)
        })
    }

    fn call_streaming(
        &self,
        prompt: &Prompt,
        model: &ModelSpec,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<StreamDelta>>>> {
        let record = RecordedModelCall {
            prompt: prompt.clone(),
            tools: vec![],
            model: model.clone(),
            streaming: true,
        };
        Box::pin(async move {
            let responses = self.next(record)?;
            let mut deltas = Vec::new();
            for response in responses {
                match response {
                    ModelResponse::Assistant { content } => {
                        // One delta per word keeps streams multi-item.
                        for (i, word) in content.split(' ').enumerate() {
                            let piece = if i == 0 { word.to_string() } else { format!(" {}", word) };
                            deltas.push(Ok(StreamDelta::TextDelta(piece)));
                        }
                    }
                    ModelResponse::ToolCall { id, tool, args } => {
                        deltas.push(Ok(StreamDelta::ToolCallStart {
                            id: id.clone(),
                            name: tool,
                        }));
                        deltas.push(Ok(StreamDelta::ToolArgsDelta {
                            id,
                            delta: args.to_string(),
                        }));
                    }
                }
            }
            deltas.push(Ok(StreamDelta::Stop));
            Ok(stream::iter(deltas).boxed())
        })
    }
}
