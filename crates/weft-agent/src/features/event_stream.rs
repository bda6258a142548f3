use std::sync::Arc;

use serde::{Deserialize, Serialize};

use weft_core::error::Result;
use weft_core::event::EventBus;

use crate::feature::{Feature, FeatureKey};
use crate::pipeline::HookInstaller;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStreamConfig {
    /// Broadcast buffer size; slow subscribers lag past this.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

fn default_capacity() -> usize {
    256
}

/// Republishes every hook firing as an [`AgentEvent`](weft_core::AgentEvent)
/// on a broadcast [`EventBus`].
pub struct EventStream;

impl EventStream {
    pub const KEY: FeatureKey = FeatureKey::new("event-stream");
}

impl Feature for EventStream {
    type Config = EventStreamConfig;
    type Instance = EventBus;

    fn key(&self) -> FeatureKey {
        Self::KEY
    }

    fn default_config(&self) -> EventStreamConfig {
        EventStreamConfig::default()
    }

    fn install(&self, config: EventStreamConfig, hooks: &mut HookInstaller<'_>) -> Result<Arc<EventBus>> {
        let bus = Arc::new(EventBus::new(config.capacity));
        let publisher = bus.clone();
        hooks.on_all(move |event| {
            publisher.publish(event.to_agent_event());
            async { Ok(()) }
        });
        Ok(bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::graph::GraphBuilder;
    use crate::pipeline::HookType;
    use weft_core::event::AgentEvent;

    #[tokio::test]
    async fn publishes_run_lifecycle() {
        let mut b = GraphBuilder::new("echo");
        let start = b.add_passthrough("start");
        let finish = b.add_passthrough("finish");
        b.edge(&start, &finish);
        b.set_start(&start);
        b.set_finish(&finish);

        let agent = Agent::builder(b.build().unwrap())
            .install(EventStream, |c| c.capacity = 64)
            .unwrap()
            .build();
        assert_eq!(agent.pipeline().len(), HookType::ALL.len());

        let bus = agent.feature::<EventBus>(&EventStream::KEY).unwrap();
        let mut rx = bus.subscribe();
        agent.run("hi").await.unwrap();

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(match event {
                AgentEvent::AgentStarting { .. } => "agent_starting",
                AgentEvent::StrategyStarted { .. } => "strategy_started",
                AgentEvent::NodeStarted { .. } => "node_started",
                AgentEvent::NodeFinished { .. } => "node_finished",
                AgentEvent::StrategyFinished { .. } => "strategy_finished",
                AgentEvent::AgentFinished { .. } => "agent_finished",
                _ => "other",
            });
        }
        assert_eq!(
            names,
            vec![
                "agent_starting",
                "strategy_started",
                "node_started",
                "node_finished",
                "node_started",
                "node_finished",
                "strategy_finished",
                "agent_finished",
            ]
        );
    }
}
