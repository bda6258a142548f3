use std::collections::HashMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level Weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeftConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Per-feature configuration tables, keyed by feature key.
    #[serde(default)]
    pub features: HashMap<String, toml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_id")]
    pub id: String,
    /// Optional provider/model pair nodes may use when they don't name one.
    #[serde(default)]
    pub model: Option<ModelConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            model: None,
        }
    }
}

fn default_agent_id() -> String {
    "weft-agent".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model_id: String,
}

impl From<&ModelConfig> for crate::types::ModelSpec {
    fn from(c: &ModelConfig) -> Self {
        crate::types::ModelSpec::new(&c.provider, &c.model_id)
    }
}

/// What happens when a feature's hook callback returns an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookFailurePolicy {
    /// Abort the run and report the failure through `AgentRunError`.
    #[default]
    Abort,
    /// Log the failure and keep dispatching to the remaining callbacks.
    Isolate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub hook_failure: HookFailurePolicy,
}

/// Log output configuration (consumed by the binary's subscriber setup).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            with_target: false,
        }
    }
}

fn default_log_filter() -> String {
    "weft=info,warn".to_string()
}

impl WeftConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))
    }

    /// Deserialize the configuration table of a feature, if present.
    pub fn feature_config<C: DeserializeOwned>(&self, key: &str) -> Result<Option<C>> {
        match self.features.get(key) {
            Some(value) => value
                .clone()
                .try_into()
                .map(Some)
                .map_err(|e| WeftError::Config(format!("features.{}: {}", key, e))),
            None => Ok(None),
        }
    }
}

/// Replace `${NAME}` with the value of environment variable `NAME`.
///
/// Unset variables and an unterminated `${` are left in the text as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = &after[..close];
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(&rest[open..open + 2 + close + 1]),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = WeftConfig::parse("").unwrap();
        assert_eq!(config.agent.id, "weft-agent");
        assert_eq!(config.pipeline.hook_failure, HookFailurePolicy::Abort);
        assert_eq!(config.log.filter, "weft=info,warn");
        assert!(config.features.is_empty());
    }

    #[test]
    fn hook_failure_policy_parses() {
        let config = WeftConfig::parse("[pipeline]\nhook_failure = \"isolate\"\n").unwrap();
        assert_eq!(config.pipeline.hook_failure, HookFailurePolicy::Isolate);
    }

    #[test]
    fn feature_table_deserializes() {
        #[derive(Deserialize)]
        struct Cfg {
            capacity: usize,
        }

        let config = WeftConfig::parse("[features.event-stream]\ncapacity = 12\n").unwrap();
        let cfg: Cfg = config.feature_config("event-stream").unwrap().unwrap();
        assert_eq!(cfg.capacity, 12);
        assert!(config.feature_config::<Cfg>("absent").unwrap().is_none());
    }

    #[test]
    fn bad_feature_table_is_config_error() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Cfg {
            capacity: usize,
        }

        let config = WeftConfig::parse("[features.event-stream]\ncapacity = \"many\"\n").unwrap();
        let err = config.feature_config::<Cfg>("event-stream").unwrap_err();
        assert!(matches!(err, WeftError::Config(m) if m.starts_with("features.event-stream")));
    }

    #[test]
    fn expand_keeps_unknown_vars() {
        assert_eq!(
            expand_env_vars("key = \"${WEFT_SURELY_UNSET_VAR}\""),
            "key = \"${WEFT_SURELY_UNSET_VAR}\""
        );
    }

    #[test]
    fn unterminated_reference_is_kept_verbatim() {
        let text = "a = \"${WEFT_OPEN\"\nb = 2\n";
        assert_eq!(expand_env_vars(text), text);
    }

    #[test]
    fn expands_set_vars_between_text() {
        std::env::set_var("WEFT_CONFIG_TEST_MODEL", "mock-2");
        assert_eq!(
            expand_env_vars("id = \"${WEFT_CONFIG_TEST_MODEL}\" # ${}"),
            "id = \"mock-2\" # ${}"
        );
    }

    #[test]
    fn invalid_toml_is_config_error() {
        assert!(matches!(
            WeftConfig::parse("[agent\nid = 1"),
            Err(WeftError::Config(_))
        ));
    }
}
