use std::fmt;

use weft_core::error::ErrorKind;
use weft_core::event::AgentEvent;
use weft_core::routing::RoutingValue;
use weft_core::types::{ModelResponse, ModelSpec, Prompt, SessionId, ToolDescriptor, ToolResult};

use crate::context::ExecutionContext;

/// Every interception point a feature can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookType {
    BeforeAgentStarted,
    AgentFinished,
    AgentRunError,
    StrategyStarted,
    StrategyFinished,
    BeforeNode,
    AfterNode,
    BeforeModelCall,
    AfterModelCall,
    ToolCall,
    ToolValidationError,
    ToolCallFailure,
    ToolCallResult,
}

impl HookType {
    pub const ALL: [HookType; 13] = [
        Self::BeforeAgentStarted,
        Self::AgentFinished,
        Self::AgentRunError,
        Self::StrategyStarted,
        Self::StrategyFinished,
        Self::BeforeNode,
        Self::AfterNode,
        Self::BeforeModelCall,
        Self::AfterModelCall,
        Self::ToolCall,
        Self::ToolValidationError,
        Self::ToolCallFailure,
        Self::ToolCallResult,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeAgentStarted => "before_agent_started",
            Self::AgentFinished => "agent_finished",
            Self::AgentRunError => "agent_run_error",
            Self::StrategyStarted => "strategy_started",
            Self::StrategyFinished => "strategy_finished",
            Self::BeforeNode => "before_node",
            Self::AfterNode => "after_node",
            Self::BeforeModelCall => "before_model_call",
            Self::AfterModelCall => "after_model_call",
            Self::ToolCall => "tool_call",
            Self::ToolValidationError => "tool_validation_error",
            Self::ToolCallFailure => "tool_call_failure",
            Self::ToolCallResult => "tool_call_result",
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a node invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Completed(RoutingValue),
    Failed { kind: ErrorKind, message: String },
    Cancelled,
}

impl NodeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn output(&self) -> Option<&RoutingValue> {
        match self {
            Self::Completed(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentStartingEvent {
    pub ctx: ExecutionContext,
    pub agent_id: String,
    pub strategy: String,
    pub input: RoutingValue,
}

#[derive(Debug, Clone)]
pub struct AgentFinishedEvent {
    pub ctx: ExecutionContext,
    pub strategy: String,
    pub result: RoutingValue,
}

#[derive(Debug, Clone)]
pub struct AgentRunErrorEvent {
    pub ctx: ExecutionContext,
    pub strategy: String,
    pub session_id: SessionId,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct StrategyStartedEvent {
    pub ctx: ExecutionContext,
    pub strategy: String,
}

#[derive(Debug, Clone)]
pub struct StrategyFinishedEvent {
    pub ctx: ExecutionContext,
    pub strategy: String,
    pub result: RoutingValue,
}

#[derive(Debug, Clone)]
pub struct NodeStartEvent {
    pub ctx: ExecutionContext,
    pub graph: String,
    pub node: String,
    pub input: RoutingValue,
}

#[derive(Debug, Clone)]
pub struct NodeFinishEvent {
    pub ctx: ExecutionContext,
    pub graph: String,
    pub node: String,
    pub input: RoutingValue,
    pub outcome: NodeOutcome,
}

#[derive(Debug, Clone)]
pub struct ModelCallStartEvent {
    pub ctx: ExecutionContext,
    pub prompt: Prompt,
    pub tools: Vec<ToolDescriptor>,
    pub model: ModelSpec,
    pub session_id: SessionId,
}

#[derive(Debug, Clone)]
pub struct ModelCallFinishEvent {
    pub ctx: ExecutionContext,
    pub prompt: Prompt,
    pub tools: Vec<ToolDescriptor>,
    pub model: ModelSpec,
    pub session_id: SessionId,
    pub responses: Vec<ModelResponse>,
}

#[derive(Debug, Clone)]
pub struct ToolCallEvent {
    pub ctx: ExecutionContext,
    pub tool: ToolDescriptor,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ToolValidationErrorEvent {
    pub ctx: ExecutionContext,
    pub tool: ToolDescriptor,
    pub args: serde_json::Value,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ToolCallFailureEvent {
    pub ctx: ExecutionContext,
    pub tool: ToolDescriptor,
    pub args: serde_json::Value,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ToolCallResultEvent {
    pub ctx: ExecutionContext,
    pub tool: ToolDescriptor,
    pub args: serde_json::Value,
    pub result: ToolResult,
}

/// Payload handed to hook callbacks. One variant per [`HookType`].
#[derive(Debug, Clone)]
pub enum HookEvent {
    BeforeAgentStarted(AgentStartingEvent),
    AgentFinished(AgentFinishedEvent),
    AgentRunError(AgentRunErrorEvent),
    StrategyStarted(StrategyStartedEvent),
    StrategyFinished(StrategyFinishedEvent),
    BeforeNode(NodeStartEvent),
    AfterNode(NodeFinishEvent),
    BeforeModelCall(ModelCallStartEvent),
    AfterModelCall(ModelCallFinishEvent),
    ToolCall(ToolCallEvent),
    ToolValidationError(ToolValidationErrorEvent),
    ToolCallFailure(ToolCallFailureEvent),
    ToolCallResult(ToolCallResultEvent),
}

impl HookEvent {
    pub fn hook_type(&self) -> HookType {
        match self {
            Self::BeforeAgentStarted(_) => HookType::BeforeAgentStarted,
            Self::AgentFinished(_) => HookType::AgentFinished,
            Self::AgentRunError(_) => HookType::AgentRunError,
            Self::StrategyStarted(_) => HookType::StrategyStarted,
            Self::StrategyFinished(_) => HookType::StrategyFinished,
            Self::BeforeNode(_) => HookType::BeforeNode,
            Self::AfterNode(_) => HookType::AfterNode,
            Self::BeforeModelCall(_) => HookType::BeforeModelCall,
            Self::AfterModelCall(_) => HookType::AfterModelCall,
            Self::ToolCall(_) => HookType::ToolCall,
            Self::ToolValidationError(_) => HookType::ToolValidationError,
            Self::ToolCallFailure(_) => HookType::ToolCallFailure,
            Self::ToolCallResult(_) => HookType::ToolCallResult,
        }
    }

    pub fn ctx(&self) -> &ExecutionContext {
        match self {
            Self::BeforeAgentStarted(e) => &e.ctx,
            Self::AgentFinished(e) => &e.ctx,
            Self::AgentRunError(e) => &e.ctx,
            Self::StrategyStarted(e) => &e.ctx,
            Self::StrategyFinished(e) => &e.ctx,
            Self::BeforeNode(e) => &e.ctx,
            Self::AfterNode(e) => &e.ctx,
            Self::BeforeModelCall(e) => &e.ctx,
            Self::AfterModelCall(e) => &e.ctx,
            Self::ToolCall(e) => &e.ctx,
            Self::ToolValidationError(e) => &e.ctx,
            Self::ToolCallFailure(e) => &e.ctx,
            Self::ToolCallResult(e) => &e.ctx,
        }
    }

    /// Flatten into a serializable record, dropping the context handle.
    pub fn to_agent_event(&self) -> AgentEvent {
        let run_id = self.ctx().run_id().to_string();
        match self {
            Self::BeforeAgentStarted(e) => AgentEvent::AgentStarting {
                run_id,
                agent_id: e.agent_id.clone(),
                strategy: e.strategy.clone(),
            },
            Self::AgentFinished(e) => AgentEvent::AgentFinished {
                run_id,
                strategy: e.strategy.clone(),
                result: e.result.clone(),
            },
            Self::AgentRunError(e) => AgentEvent::AgentRunError {
                run_id,
                strategy: e.strategy.clone(),
                session_id: e.session_id.to_string(),
                kind: e.kind,
                message: e.message.clone(),
            },
            Self::StrategyStarted(e) => AgentEvent::StrategyStarted {
                run_id,
                strategy: e.strategy.clone(),
            },
            Self::StrategyFinished(e) => AgentEvent::StrategyFinished {
                run_id,
                strategy: e.strategy.clone(),
                result: e.result.clone(),
            },
            Self::BeforeNode(e) => AgentEvent::NodeStarted {
                run_id,
                graph: e.graph.clone(),
                node: e.node.clone(),
                input: e.input.clone(),
            },
            Self::AfterNode(e) => AgentEvent::NodeFinished {
                run_id,
                graph: e.graph.clone(),
                node: e.node.clone(),
                outcome: e.outcome.as_str().to_string(),
                output: e.outcome.output().cloned(),
            },
            Self::BeforeModelCall(e) => AgentEvent::ModelCallStarted {
                run_id,
                prompt_id: e.prompt.id.clone(),
                model: e.model.to_string(),
                tools: e.tools.iter().map(|t| t.name.clone()).collect(),
            },
            Self::AfterModelCall(e) => AgentEvent::ModelCallFinished {
                run_id,
                prompt_id: e.prompt.id.clone(),
                model: e.model.to_string(),
                responses: e.responses.clone(),
            },
            Self::ToolCall(e) => AgentEvent::ToolCallStarted {
                run_id,
                tool: e.tool.name.clone(),
                args: e.args.clone(),
            },
            Self::ToolValidationError(e) => AgentEvent::ToolValidationFailed {
                run_id,
                tool: e.tool.name.clone(),
                error: e.error.clone(),
            },
            Self::ToolCallFailure(e) => AgentEvent::ToolCallFailed {
                run_id,
                tool: e.tool.name.clone(),
                error: e.error.clone(),
            },
            Self::ToolCallResult(e) => AgentEvent::ToolCallFinished {
                run_id,
                tool: e.tool.name.clone(),
                result: e.result.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_type_names_are_unique() {
        let mut names: Vec<&str> = HookType::ALL.iter().map(|h| h.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), HookType::ALL.len());
        assert_eq!(HookType::AfterNode.to_string(), "after_node");
    }

    #[test]
    fn node_finish_flattens_outcome() {
        let ctx = ExecutionContext::detached("g");
        let event = HookEvent::AfterNode(NodeFinishEvent {
            ctx: ctx.clone(),
            graph: "g".into(),
            node: "a".into(),
            input: RoutingValue::from(1i64),
            outcome: NodeOutcome::Completed(RoutingValue::from(2i64)),
        });
        assert_eq!(event.hook_type(), HookType::AfterNode);
        match event.to_agent_event() {
            AgentEvent::NodeFinished {
                run_id,
                outcome,
                output,
                ..
            } => {
                assert_eq!(run_id, ctx.run_id().to_string());
                assert_eq!(outcome, "completed");
                assert_eq!(output, Some(RoutingValue::from(2i64)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn failed_outcome_has_no_output() {
        let outcome = NodeOutcome::Failed {
            kind: ErrorKind::NodeExecution,
            message: "boom".into(),
        };
        assert_eq!(outcome.as_str(), "failed");
        assert!(outcome.output().is_none());
    }
}
