use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use weft_core::error::{Result, WeftError};

use crate::pipeline::HookInstaller;

/// Stable identity of a feature. Unique within an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureKey(Cow<'static, str>);

impl FeatureKey {
    pub const fn new(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn owned(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An extension installed into an agent's pipeline.
///
/// `install` runs once while the agent is assembled. It registers hook
/// callbacks through the installer and returns the feature's runtime
/// instance, which callers later fetch with `Agent::feature`.
pub trait Feature: Send + Sync + 'static {
    type Config: DeserializeOwned + Send + 'static;
    type Instance: Send + Sync + 'static;

    fn key(&self) -> FeatureKey;

    fn default_config(&self) -> Self::Config;

    fn install(
        &self,
        config: Self::Config,
        hooks: &mut HookInstaller<'_>,
    ) -> Result<Arc<Self::Instance>>;
}

/// Installed feature instances of one agent, keyed by feature key.
#[derive(Default)]
pub struct FeatureRegistry {
    instances: HashMap<FeatureKey, Arc<dyn Any + Send + Sync>>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, key: FeatureKey, instance: Arc<T>) -> Result<()> {
        if self.instances.contains_key(&key) {
            return Err(WeftError::FeatureAlreadyInstalled(key.to_string()));
        }
        self.instances.insert(key, instance);
        Ok(())
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: &FeatureKey) -> Result<Arc<T>> {
        let instance = self
            .instances
            .get(key)
            .ok_or_else(|| WeftError::FeatureNotInstalled(key.to_string()))?;
        instance
            .clone()
            .downcast::<T>()
            .map_err(|_| WeftError::FeatureTypeMismatch(key.to_string()))
    }

    pub fn contains(&self, key: &FeatureKey) -> bool {
        self.instances.contains_key(key)
    }

    /// Installed keys, sorted.
    pub fn keys(&self) -> Vec<&FeatureKey> {
        let mut keys: Vec<&FeatureKey> = self.instances.keys().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl fmt::Debug for FeatureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}
