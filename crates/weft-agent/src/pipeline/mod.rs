//! Feature-interception pipeline.
//!
//! Features register callbacks against [`HookType`]s while an agent is being
//! assembled. At run time the interpreter and the execution context fire
//! [`HookEvent`]s through the pipeline; callbacks for a hook run one after the
//! other in registration order, each awaited before the next.

pub mod hook;

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{error, warn};

use weft_core::config::HookFailurePolicy;
use weft_core::error::{Result, WeftError};

use crate::feature::FeatureKey;
pub use hook::*;

pub type HookCallback = Arc<dyn Fn(HookEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Registration {
    feature: FeatureKey,
    callback: HookCallback,
}

/// Ordered per-agent registry of hook callbacks.
///
/// Frozen once the agent is built; shared by every run through an `Arc`.
pub struct Pipeline {
    hooks: HashMap<HookType, Vec<Registration>>,
    policy: HookFailurePolicy,
}

impl Pipeline {
    pub fn new(policy: HookFailurePolicy) -> Self {
        Self {
            hooks: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> HookFailurePolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: HookFailurePolicy) {
        self.policy = policy;
    }

    /// Registration handle for one feature. Every callback added through it
    /// is tagged with `feature`.
    pub fn installer(&mut self, feature: FeatureKey) -> HookInstaller<'_> {
        HookInstaller {
            pipeline: self,
            feature,
        }
    }

    /// Total number of registered callbacks.
    pub fn len(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of the features registered for `hook`, in dispatch order.
    pub fn features_for(&self, hook: HookType) -> Vec<&FeatureKey> {
        self.hooks
            .get(&hook)
            .map(|regs| regs.iter().map(|r| &r.feature).collect())
            .unwrap_or_default()
    }

    /// Dispatch `event` to every callback registered for its hook type.
    ///
    /// Under [`HookFailurePolicy::Abort`] the first failing callback stops
    /// dispatch and its failure is returned as `HookFailed`. Under
    /// [`HookFailurePolicy::Isolate`] failures are logged and dispatch goes on.
    pub async fn fire(&self, event: HookEvent) -> Result<()> {
        let hook = event.hook_type();
        let Some(regs) = self.hooks.get(&hook) else {
            return Ok(());
        };

        for reg in regs {
            if let Err(e) = invoke(reg, event.clone()).await {
                match self.policy {
                    HookFailurePolicy::Abort => return Err(e),
                    HookFailurePolicy::Isolate => {
                        warn!(
                            feature = %reg.feature,
                            hook = %hook,
                            error = %e,
                            "Hook failed; continuing"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Dispatch an `AgentRunError` event. Failures are logged and never
    /// replace the error being reported.
    pub async fn fire_run_error(&self, event: HookEvent) {
        let hook = event.hook_type();
        let Some(regs) = self.hooks.get(&hook) else {
            return;
        };
        for reg in regs {
            if let Err(e) = invoke(reg, event.clone()).await {
                error!(feature = %reg.feature, hook = %hook, error = %e, "Run error hook failed");
            }
        }
    }

    fn register(&mut self, hook: HookType, feature: FeatureKey, callback: HookCallback) {
        self.hooks
            .entry(hook)
            .or_default()
            .push(Registration { feature, callback });
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(HookFailurePolicy::default())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("policy", &self.policy)
            .field("callbacks", &self.len())
            .finish()
    }
}

async fn invoke(reg: &Registration, event: HookEvent) -> Result<()> {
    let hook = event.hook_type();
    let fut = (reg.callback)(event);
    let result = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(WeftError::Node(format!(
            "callback panicked: {}",
            panic_message(panic.as_ref())
        ))),
    };
    result.map_err(|e| match e {
        already @ WeftError::HookFailed { .. } => already,
        other => WeftError::HookFailed {
            feature: reg.feature.to_string(),
            hook: hook.to_string(),
            message: other.to_string(),
        },
    })
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Registers callbacks on behalf of one feature during installation.
pub struct HookInstaller<'a> {
    pipeline: &'a mut Pipeline,
    feature: FeatureKey,
}

macro_rules! typed_hook {
    ($(#[$doc:meta])* $method:ident, $variant:ident, $event:ty) => {
        $(#[$doc])*
        pub fn $method<F, Fut>(&mut self, f: F) -> &mut Self
        where
            F: Fn($event) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<()>> + Send + 'static,
        {
            self.register(
                HookType::$variant,
                Arc::new(move |event: HookEvent| -> BoxFuture<'static, Result<()>> {
                    match event {
                        HookEvent::$variant(e) => Box::pin(f(e)),
                        _ => Box::pin(async { Ok(()) }),
                    }
                }),
            )
        }
    };
}

impl HookInstaller<'_> {
    pub fn feature(&self) -> &FeatureKey {
        &self.feature
    }

    /// Register a callback receiving the untyped event.
    pub fn on<F, Fut>(&mut self, hook: HookType, f: F) -> &mut Self
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(
            hook,
            Arc::new(move |event: HookEvent| -> BoxFuture<'static, Result<()>> { Box::pin(f(event)) }),
        )
    }

    /// Register the same callback on every hook type.
    pub fn on_all<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let callback: HookCallback =
            Arc::new(move |event: HookEvent| -> BoxFuture<'static, Result<()>> { Box::pin(f(event)) });
        for hook in HookType::ALL {
            self.register(hook, callback.clone());
        }
        self
    }

    typed_hook!(on_before_agent_started, BeforeAgentStarted, AgentStartingEvent);
    typed_hook!(on_agent_finished, AgentFinished, AgentFinishedEvent);
    typed_hook!(
        /// Fires once per failed top-level run; its own failures are only logged.
        on_agent_run_error,
        AgentRunError,
        AgentRunErrorEvent
    );
    typed_hook!(on_strategy_started, StrategyStarted, StrategyStartedEvent);
    typed_hook!(on_strategy_finished, StrategyFinished, StrategyFinishedEvent);
    typed_hook!(on_before_node, BeforeNode, NodeStartEvent);
    typed_hook!(
        /// Fires after every node, whether it completed, failed or was cancelled.
        on_after_node,
        AfterNode,
        NodeFinishEvent
    );
    typed_hook!(on_before_model_call, BeforeModelCall, ModelCallStartEvent);
    typed_hook!(on_after_model_call, AfterModelCall, ModelCallFinishEvent);
    typed_hook!(on_tool_call, ToolCall, ToolCallEvent);
    typed_hook!(on_tool_validation_error, ToolValidationError, ToolValidationErrorEvent);
    typed_hook!(on_tool_call_failure, ToolCallFailure, ToolCallFailureEvent);
    typed_hook!(on_tool_call_result, ToolCallResult, ToolCallResultEvent);

    fn register(&mut self, hook: HookType, callback: HookCallback) -> &mut Self {
        self.pipeline.register(hook, self.feature.clone(), callback);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use std::sync::Mutex;
    use weft_core::routing::RoutingValue;

    fn strategy_started(ctx: &ExecutionContext) -> HookEvent {
        HookEvent::StrategyStarted(StrategyStartedEvent {
            ctx: ctx.clone(),
            strategy: "s".into(),
        })
    }

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        tag: &'static str,
    ) -> impl Fn(HookEvent) -> BoxFuture<'static, Result<()>> + Send + Sync {
        let log = log.clone();
        move |_event: HookEvent| -> BoxFuture<'static, Result<()>> {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(tag.to_string());
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn dispatches_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::default();
        pipeline
            .installer(FeatureKey::new("first"))
            .on(HookType::StrategyStarted, recorder(&log, "first"));
        pipeline
            .installer(FeatureKey::new("second"))
            .on(HookType::StrategyStarted, recorder(&log, "second"))
            .on(HookType::StrategyStarted, recorder(&log, "second-again"));

        let ctx = ExecutionContext::detached("g");
        pipeline.fire(strategy_started(&ctx)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "second-again"]);
        assert_eq!(pipeline.len(), 3);
        let features: Vec<&str> = pipeline
            .features_for(HookType::StrategyStarted)
            .iter()
            .map(|k| k.as_str())
            .collect();
        assert_eq!(features, vec!["first", "second", "second"]);
    }

    #[tokio::test]
    async fn other_hook_types_are_not_called() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::default();
        pipeline
            .installer(FeatureKey::new("f"))
            .on(HookType::AgentFinished, recorder(&log, "finished"));
        let ctx = ExecutionContext::detached("g");
        pipeline.fire(strategy_started(&ctx)).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn abort_policy_stops_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new(HookFailurePolicy::Abort);
        pipeline
            .installer(FeatureKey::new("broken"))
            .on_strategy_started(|_e| async { Err(WeftError::node("nope")) });
        pipeline
            .installer(FeatureKey::new("after"))
            .on(HookType::StrategyStarted, recorder(&log, "after"));

        let ctx = ExecutionContext::detached("g");
        let err = pipeline.fire(strategy_started(&ctx)).await.unwrap_err();
        match err {
            WeftError::HookFailed { feature, hook, message } => {
                assert_eq!(feature, "broken");
                assert_eq!(hook, "strategy_started");
                assert!(message.contains("nope"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn isolate_policy_continues() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new(HookFailurePolicy::Isolate);
        pipeline
            .installer(FeatureKey::new("broken"))
            .on_strategy_started(|_e| async { Err(WeftError::node("nope")) });
        pipeline
            .installer(FeatureKey::new("after"))
            .on(HookType::StrategyStarted, recorder(&log, "after"));

        let ctx = ExecutionContext::detached("g");
        pipeline.fire(strategy_started(&ctx)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn panicking_callback_becomes_hook_failure() {
        let mut pipeline = Pipeline::default();
        pipeline
            .installer(FeatureKey::new("panicky"))
            .on_strategy_started(|e| async move {
                if e.strategy == "s" {
                    panic!("kaboom");
                }
                Ok(())
            });
        let ctx = ExecutionContext::detached("g");
        let err = pipeline.fire(strategy_started(&ctx)).await.unwrap_err();
        assert!(matches!(err, WeftError::HookFailed { ref message, .. } if message.contains("kaboom")));
    }

    #[tokio::test]
    async fn typed_hooks_receive_their_payload() {
        let seen = Arc::new(Mutex::new(None));
        let mut pipeline = Pipeline::default();
        let sink = seen.clone();
        pipeline
            .installer(FeatureKey::new("typed"))
            .on_before_node(move |e| {
                let sink = sink.clone();
                async move {
                    *sink.lock().unwrap() = Some((e.node, e.input));
                    Ok(())
                }
            });

        let ctx = ExecutionContext::detached("g");
        pipeline
            .fire(HookEvent::BeforeNode(NodeStartEvent {
                ctx,
                graph: "g".into(),
                node: "a".into(),
                input: RoutingValue::from(7i64),
            }))
            .await
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            Some(("a".to_string(), RoutingValue::from(7i64)))
        );
    }

    #[tokio::test]
    async fn run_error_failures_are_swallowed() {
        let mut pipeline = Pipeline::default();
        pipeline
            .installer(FeatureKey::new("broken"))
            .on_agent_run_error(|_e| async { Err(WeftError::node("nope")) });
        let ctx = ExecutionContext::detached("g");
        pipeline
            .fire_run_error(HookEvent::AgentRunError(AgentRunErrorEvent {
                ctx: ctx.clone(),
                strategy: "g".into(),
                session_id: ctx.session_id().clone(),
                kind: weft_core::ErrorKind::NoRoute,
                message: "no route".into(),
            }))
            .await;
    }
}
