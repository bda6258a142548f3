//! Mocks and fixtures shared by the Weft test suites.

mod model;
mod recording;
mod tools;

use std::path::PathBuf;

use weft_core::config::WeftConfig;

pub use model::{MockModelCaller, RecordedModelCall};
pub use recording::{Recorded, RecordingConfig, RecordingFeature, RecordingLog};
pub use tools::{MockToolCaller, RecordedToolCall};

/// TOML used by [`test_config`].
pub const TEST_CONFIG_TOML: &str = r#"
[agent]
id = "test-agent"

[agent.model]
provider = "mock"
model_id = "mock-1"

[pipeline]
hook_failure = "abort"

[log]
filter = "weft=debug"

[features.event-stream]
capacity = 16
"#;

/// A small configuration with every section filled in.
pub fn test_config() -> WeftConfig {
    match WeftConfig::parse(TEST_CONFIG_TOML) {
        Ok(config) => config,
        Err(e) => panic!("test config must parse: {}", e),
    }
}

/// Write `contents` to `weft.toml` in a fresh temporary directory.
///
/// Keep the returned directory alive for as long as the file is needed.
pub fn write_temp_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => panic!("failed to create temp dir: {}", e),
    };
    let path = dir.path().join("weft.toml");
    if let Err(e) = std::fs::write(&path, contents) {
        panic!("failed to write {}: {}", path.display(), e);
    }
    (dir, path)
}
