use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use weft_core::config::{HookFailurePolicy, WeftConfig};
use weft_core::error::{Result, WeftError};
use weft_core::routing::RoutingValue;
use weft_core::traits::{ModelCaller, ToolCaller};
use weft_core::types::{ModelSpec, SessionId};

use crate::context::{ExecutionContext, Services};
use crate::feature::{Feature, FeatureKey, FeatureRegistry};
use crate::graph::{Graph, Interpreter};
use crate::pipeline::Pipeline;

/// An assembled agent: a strategy graph, the installed features and the
/// services its nodes call.
///
/// Immutable once built. Every `run` gets a fresh [`ExecutionContext`], so one
/// agent can serve concurrent runs.
pub struct Agent {
    id: String,
    interpreter: Interpreter,
    pipeline: Arc<Pipeline>,
    features: Arc<FeatureRegistry>,
    services: Services,
}

impl Agent {
    pub fn builder(strategy: impl Into<Arc<Graph>>) -> AgentBuilder {
        AgentBuilder::new(strategy)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn strategy(&self) -> &Graph {
        self.interpreter.graph()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn features(&self) -> &FeatureRegistry {
        &self.features
    }

    /// Fetch an installed feature's instance.
    pub fn feature<T: Send + Sync + 'static>(&self, key: &FeatureKey) -> Result<Arc<T>> {
        self.features.get(key)
    }

    /// A fresh top-level context for one run of this agent.
    pub fn new_context(&self, session_id: Option<SessionId>, cancel: CancellationToken) -> ExecutionContext {
        let mut builder = ExecutionContext::builder(self.strategy().name())
            .agent_id(self.id.clone())
            .services(self.services.clone())
            .pipeline(self.pipeline.clone())
            .features(self.features.clone())
            .cancel_token(cancel);
        if let Some(session_id) = session_id {
            builder = builder.session_id(session_id);
        }
        builder.build()
    }

    pub async fn run(&self, input: impl Into<RoutingValue>) -> Result<RoutingValue> {
        self.run_with_cancel(input, CancellationToken::new()).await
    }

    /// Run with a caller-owned cancellation token.
    pub async fn run_with_cancel(
        &self,
        input: impl Into<RoutingValue>,
        cancel: CancellationToken,
    ) -> Result<RoutingValue> {
        let ctx = self.new_context(None, cancel);
        self.run_with_context(&ctx, input).await
    }

    /// Run on a context from [`new_context`](Self::new_context), leaving it
    /// available for inspection afterwards.
    pub async fn run_with_context(
        &self,
        ctx: &ExecutionContext,
        input: impl Into<RoutingValue>,
    ) -> Result<RoutingValue> {
        self.interpreter.run(ctx, input.into()).await
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("strategy", &self.strategy().name())
            .field("pipeline", &self.pipeline)
            .field("features", &self.features)
            .finish()
    }
}

/// Assembles an [`Agent`]. Features are installed in call order, which is
/// also the order their hooks are dispatched in.
pub struct AgentBuilder {
    id: String,
    strategy: Arc<Graph>,
    services: Services,
    pipeline: Pipeline,
    features: FeatureRegistry,
}

impl AgentBuilder {
    pub fn new(strategy: impl Into<Arc<Graph>>) -> Self {
        Self {
            id: "weft-agent".to_string(),
            strategy: strategy.into(),
            services: Services::default(),
            pipeline: Pipeline::default(),
            features: FeatureRegistry::new(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn model_caller(mut self, caller: Arc<dyn ModelCaller>) -> Self {
        self.services.model = Some(caller);
        self
    }

    pub fn tool_caller(mut self, caller: Arc<dyn ToolCaller>) -> Self {
        self.services.tools = Some(caller);
        self
    }

    pub fn default_model(mut self, model: ModelSpec) -> Self {
        self.services.default_model = Some(model);
        self
    }

    pub fn hook_failure(mut self, policy: HookFailurePolicy) -> Self {
        self.pipeline.set_policy(policy);
        self
    }

    /// Apply agent id, default model and hook failure policy from config.
    pub fn with_config(mut self, config: &WeftConfig) -> Self {
        self.id = config.agent.id.clone();
        if let Some(model) = &config.agent.model {
            self.services.default_model = Some(model.into());
        }
        self.pipeline.set_policy(config.pipeline.hook_failure);
        self
    }

    /// Install a feature, starting from its default config.
    pub fn install<F: Feature>(
        mut self,
        feature: F,
        configure: impl FnOnce(&mut F::Config),
    ) -> Result<Self> {
        let mut config = feature.default_config();
        configure(&mut config);
        self.install_with(feature, config)?;
        Ok(self)
    }

    /// Install a feature using its `[features.<key>]` table from `config`,
    /// or its default config if the table is absent.
    pub fn install_configured<F: Feature>(mut self, feature: F, config: &WeftConfig) -> Result<Self> {
        let key = feature.key();
        let feature_config = match config.feature_config::<F::Config>(key.as_str())? {
            Some(c) => c,
            None => feature.default_config(),
        };
        self.install_with(feature, feature_config)?;
        Ok(self)
    }

    fn install_with<F: Feature>(&mut self, feature: F, config: F::Config) -> Result<()> {
        let key = feature.key();
        if self.features.contains(&key) {
            return Err(WeftError::FeatureAlreadyInstalled(key.to_string()));
        }
        let before = self.pipeline.len();
        let instance = feature.install(config, &mut self.pipeline.installer(key.clone()))?;
        debug!(
            feature = %key,
            hooks = self.pipeline.len() - before,
            "Feature installed"
        );
        self.features.insert(key, instance)
    }

    pub fn build(self) -> Agent {
        info!(
            agent_id = %self.id,
            strategy = %self.strategy.name(),
            features = self.features.len(),
            hooks = self.pipeline.len(),
            "Agent assembled"
        );
        Agent {
            id: self.id,
            interpreter: Interpreter::new(self.strategy),
            pipeline: Arc::new(self.pipeline),
            features: Arc::new(self.features),
            services: self.services,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::pipeline::HookInstaller;
    use serde::Deserialize;

    fn identity_graph() -> Graph {
        let mut b = GraphBuilder::new("identity");
        let start = b.add_passthrough("start");
        let finish = b.add_passthrough("finish");
        b.edge(&start, &finish);
        b.set_start(&start);
        b.set_finish(&finish);
        b.build().unwrap()
    }

    #[derive(Debug, Clone, Deserialize)]
    struct LabelConfig {
        label: String,
    }

    struct Label;

    impl Feature for Label {
        type Config = LabelConfig;
        type Instance = String;

        fn key(&self) -> FeatureKey {
            FeatureKey::new("label")
        }

        fn default_config(&self) -> LabelConfig {
            LabelConfig {
                label: "default".into(),
            }
        }

        fn install(&self, config: LabelConfig, hooks: &mut HookInstaller<'_>) -> Result<Arc<String>> {
            hooks.on_agent_finished(|_e| async { Ok(()) });
            Ok(Arc::new(config.label))
        }
    }

    #[tokio::test]
    async fn runs_and_exposes_features() {
        let agent = Agent::builder(identity_graph())
            .id("tester")
            .install(Label, |c| c.label = "custom".into())
            .unwrap()
            .build();

        assert_eq!(agent.id(), "tester");
        assert_eq!(agent.pipeline().len(), 1);
        let label = agent.feature::<String>(&FeatureKey::new("label")).unwrap();
        assert_eq!(label.as_str(), "custom");

        let out = agent.run(4i64).await.unwrap();
        assert_eq!(out.as_i64(), Some(4));
    }

    #[test]
    fn double_install_is_rejected() {
        let result = Agent::builder(identity_graph())
            .install(Label, |_| {})
            .unwrap()
            .install(Label, |_| {});
        assert!(matches!(result, Err(WeftError::FeatureAlreadyInstalled(_))));
    }

    #[test]
    fn configured_install_reads_feature_table() {
        let config = WeftConfig::parse(
            r#"
            [agent]
            id = "from-config"

            [pipeline]
            hook_failure = "isolate"

            [features.label]
            label = "configured"
            "#,
        )
        .unwrap();

        let agent = Agent::builder(identity_graph())
            .with_config(&config)
            .install_configured(Label, &config)
            .unwrap()
            .build();
        assert_eq!(agent.id(), "from-config");
        assert_eq!(agent.pipeline().policy(), HookFailurePolicy::Isolate);
        let label = agent.feature::<String>(&FeatureKey::new("label")).unwrap();
        assert_eq!(label.as_str(), "configured");
    }

    #[test]
    fn configured_install_falls_back_to_default() {
        let config = WeftConfig::default();
        let agent = Agent::builder(identity_graph())
            .install_configured(Label, &config)
            .unwrap()
            .build();
        let label = agent.feature::<String>(&FeatureKey::new("label")).unwrap();
        assert_eq!(label.as_str(), "default");
    }
}
