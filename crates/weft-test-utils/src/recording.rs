use std::sync::{Arc, Mutex};

use serde::Deserialize;

use weft_agent::feature::{Feature, FeatureKey};
use weft_agent::pipeline::{HookEvent, HookInstaller, HookType};
use weft_core::error::{Result, WeftError};

/// One hook firing as seen by [`RecordingFeature`].
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub hook: HookType,
    /// Node id for node hooks, tool name for tool hooks, strategy name otherwise.
    pub label: String,
    pub run_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordingConfig {
    /// Hook name (e.g. `before_node`) whose callback returns an error.
    #[serde(default)]
    pub fail_on: Option<String>,
}

/// Shared log written by [`RecordingFeature`].
#[derive(Debug, Default)]
pub struct RecordingLog {
    entries: Mutex<Vec<Recorded>>,
}

impl RecordingLog {
    pub fn entries(&self) -> Vec<Recorded> {
        self.entries.lock().unwrap().clone()
    }

    pub fn hooks(&self) -> Vec<HookType> {
        self.entries().into_iter().map(|r| r.hook).collect()
    }

    pub fn count(&self, hook: HookType) -> usize {
        self.entries().iter().filter(|r| r.hook == hook).count()
    }

    /// Labels of every firing of `hook`, in order.
    pub fn labels(&self, hook: HookType) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|r| r.hook == hook)
            .map(|r| r.label)
            .collect()
    }

    /// Entries belonging to one run.
    pub fn for_run(&self, run_id: &str) -> Vec<Recorded> {
        self.entries()
            .into_iter()
            .filter(|r| r.run_id == run_id)
            .collect()
    }

    fn push(&self, entry: Recorded) {
        self.entries.lock().unwrap().push(entry);
    }
}

/// Records every hook firing, in order.
///
/// Install several under different keys to observe dispatch order between
/// features.
pub struct RecordingFeature {
    key: FeatureKey,
}

impl RecordingFeature {
    pub const KEY: FeatureKey = FeatureKey::new("recording");

    pub fn new() -> Self {
        Self { key: Self::KEY }
    }

    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: FeatureKey::owned(key),
        }
    }
}

impl Default for RecordingFeature {
    fn default() -> Self {
        Self::new()
    }
}

fn label(event: &HookEvent) -> String {
    match event {
        HookEvent::BeforeAgentStarted(e) => e.strategy.clone(),
        HookEvent::AgentFinished(e) => e.strategy.clone(),
        HookEvent::AgentRunError(e) => e.strategy.clone(),
        HookEvent::StrategyStarted(e) => e.strategy.clone(),
        HookEvent::StrategyFinished(e) => e.strategy.clone(),
        HookEvent::BeforeNode(e) => e.node.clone(),
        HookEvent::AfterNode(e) => e.node.clone(),
        HookEvent::BeforeModelCall(e) => e.model.to_string(),
        HookEvent::AfterModelCall(e) => e.model.to_string(),
        HookEvent::ToolCall(e) => e.tool.name.clone(),
        HookEvent::ToolValidationError(e) => e.tool.name.clone(),
        HookEvent::ToolCallFailure(e) => e.tool.name.clone(),
        HookEvent::ToolCallResult(e) => e.tool.name.clone(),
    }
}

impl Feature for RecordingFeature {
    type Config = RecordingConfig;
    type Instance = RecordingLog;

    fn key(&self) -> FeatureKey {
        self.key.clone()
    }

    fn default_config(&self) -> RecordingConfig {
        RecordingConfig::default()
    }

    fn install(&self, config: RecordingConfig, hooks: &mut HookInstaller<'_>) -> Result<Arc<RecordingLog>> {
        let log = Arc::new(RecordingLog::default());
        let sink = log.clone();
        let fail_on = config.fail_on;
        hooks.on_all(move |event| {
            let hook = event.hook_type();
            sink.push(Recorded {
                hook,
                label: label(&event),
                run_id: event.ctx().run_id().to_string(),
            });
            let fail = fail_on.as_deref() == Some(hook.as_str());
            async move {
                if fail {
                    Err(WeftError::node(format!("recording configured to fail on {}", hook)))
                } else {
                    Ok(())
                }
            }
        });
        Ok(log)
    }
}
