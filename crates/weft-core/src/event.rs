use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::routing::RoutingValue;
use crate::types::{ModelResponse, ToolResult};

/// Flat, serializable record of one pipeline hook firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStarting {
        run_id: String,
        agent_id: String,
        strategy: String,
    },
    AgentFinished {
        run_id: String,
        strategy: String,
        result: RoutingValue,
    },
    AgentRunError {
        run_id: String,
        strategy: String,
        session_id: String,
        kind: ErrorKind,
        message: String,
    },
    StrategyStarted {
        run_id: String,
        strategy: String,
    },
    StrategyFinished {
        run_id: String,
        strategy: String,
        result: RoutingValue,
    },
    NodeStarted {
        run_id: String,
        graph: String,
        node: String,
        input: RoutingValue,
    },
    NodeFinished {
        run_id: String,
        graph: String,
        node: String,
        /// `completed`, `failed` or `cancelled`.
        outcome: String,
        output: Option<RoutingValue>,
    },
    ModelCallStarted {
        run_id: String,
        prompt_id: String,
        model: String,
        tools: Vec<String>,
    },
    ModelCallFinished {
        run_id: String,
        prompt_id: String,
        model: String,
        responses: Vec<ModelResponse>,
    },
    ToolCallStarted {
        run_id: String,
        tool: String,
        args: serde_json::Value,
    },
    ToolValidationFailed {
        run_id: String,
        tool: String,
        error: String,
    },
    ToolCallFailed {
        run_id: String,
        tool: String,
        error: String,
    },
    ToolCallFinished {
        run_id: String,
        tool: String,
        result: ToolResult,
    },
}

impl AgentEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::AgentStarting { run_id, .. }
            | Self::AgentFinished { run_id, .. }
            | Self::AgentRunError { run_id, .. }
            | Self::StrategyStarted { run_id, .. }
            | Self::StrategyFinished { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeFinished { run_id, .. }
            | Self::ModelCallStarted { run_id, .. }
            | Self::ModelCallFinished { run_id, .. }
            | Self::ToolCallStarted { run_id, .. }
            | Self::ToolValidationFailed { run_id, .. }
            | Self::ToolCallFailed { run_id, .. }
            | Self::ToolCallFinished { run_id, .. } => run_id,
        }
    }
}

/// Fan-out channel for [`AgentEvent`]s.
///
/// Every receiver sees every event published after it subscribed; a receiver
/// that falls more than `capacity` events behind gets `Lagged` and skips ahead.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers. With none, the event is dropped.
    pub fn publish(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(AgentEvent::StrategyStarted {
            run_id: "r1".into(),
            strategy: "s".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), "r1");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        assert_eq!(bus.receiver_count(), 0);
        bus.publish(AgentEvent::ToolCallFailed {
            run_id: "r".into(),
            tool: "bash".into(),
            error: "boom".into(),
        });
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = AgentEvent::NodeFinished {
            run_id: "r".into(),
            graph: "g".into(),
            node: "n".into(),
            outcome: "completed".into(),
            output: Some(RoutingValue::from(1i64)),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "node_finished");
        assert_eq!(json["output"]["kind"], "value");
    }
}
