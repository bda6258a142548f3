use std::io::Write;

use weft_agent::{Agent, EventStream, EventStreamConfig, GraphBuilder};
use weft_core::config::{HookFailurePolicy, WeftConfig};
use weft_core::error::WeftError;
use weft_core::event::EventBus;
use weft_core::types::ModelSpec;
use weft_test_utils::{test_config, write_temp_config, TEST_CONFIG_TOML};

fn passthrough_graph() -> weft_agent::Graph {
    let mut b = GraphBuilder::new("plain");
    let only = b.add_passthrough("only");
    b.set_start(&only);
    b.set_finish(&only);
    b.build().unwrap()
}

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[agent]
id = "ci-agent"

[agent.model]
provider = "anthropic"
model_id = "claude-sonnet"

[pipeline]
hook_failure = "isolate"

[log]
filter = "weft=debug"
with_target = true

[features.event-stream]
capacity = 32
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = WeftConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.agent.id, "ci-agent");
    let model = config.agent.model.as_ref().unwrap();
    assert_eq!(ModelSpec::from(model), ModelSpec::new("anthropic", "claude-sonnet"));
    assert_eq!(config.pipeline.hook_failure, HookFailurePolicy::Isolate);
    assert_eq!(config.log.filter, "weft=debug");
    assert!(config.log.with_target);

    let stream: EventStreamConfig = config.feature_config("event-stream").unwrap().unwrap();
    assert_eq!(stream.capacity, 32);
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = WeftConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, WeftError::ConfigNotFound(_)));
}

#[test]
fn test_env_vars_are_expanded() {
    std::env::set_var("WEFT_TEST_AGENT_ID", "from-env");
    let config = WeftConfig::parse("[agent]\nid = \"${WEFT_TEST_AGENT_ID}\"\n").unwrap();
    assert_eq!(config.agent.id, "from-env");
}

#[test]
fn test_config_roundtrips_through_toml() {
    let config = WeftConfig::parse(
        "[pipeline]\nhook_failure = \"isolate\"\n\n[features.event-stream]\ncapacity = 8\n",
    )
    .unwrap();
    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = WeftConfig::parse(&rendered).unwrap();
    assert_eq!(reparsed.pipeline.hook_failure, HookFailurePolicy::Isolate);
    assert_eq!(reparsed.features.len(), 1);
}

#[tokio::test]
async fn test_agent_picks_up_config() {
    let config = WeftConfig::parse(
        "[agent]\nid = \"configured\"\n\n[pipeline]\nhook_failure = \"isolate\"\n\n\
         [features.event-stream]\ncapacity = 4\n",
    )
    .unwrap();

    let agent = Agent::builder(passthrough_graph())
        .with_config(&config)
        .install_configured(EventStream, &config)
        .unwrap()
        .build();

    assert_eq!(agent.id(), "configured");
    assert_eq!(agent.pipeline().policy(), HookFailurePolicy::Isolate);
    assert!(agent.feature::<EventBus>(&EventStream::KEY).is_ok());

    let out = agent.run(3i64).await.unwrap();
    assert_eq!(out.as_i64(), Some(3));
}

#[test]
fn test_bad_feature_table_is_rejected() {
    let config = WeftConfig::parse("[features.event-stream]\ncapacity = \"lots\"\n").unwrap();
    let result = Agent::builder(passthrough_graph()).install_configured(EventStream, &config);
    assert!(matches!(result, Err(WeftError::Config(_))));
}

#[test]
fn test_shared_fixture_loads_from_disk() {
    let (_dir, path) = write_temp_config(TEST_CONFIG_TOML);
    let from_disk = WeftConfig::load(&path).unwrap();
    let in_memory = test_config();

    assert_eq!(from_disk.agent.id, in_memory.agent.id);
    assert_eq!(from_disk.agent.model, in_memory.agent.model);
    assert_eq!(from_disk.log.filter, "weft=debug");
    assert!(!from_disk.log.with_target);
}
