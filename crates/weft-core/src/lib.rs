pub mod config;
pub mod error;
pub mod event;
pub mod routing;
pub mod storage;
pub mod traits;
pub mod types;

pub use config::WeftConfig;
pub use error::{ErrorKind, GraphDefinitionError, Result, WeftError};
pub use event::{AgentEvent, EventBus};
pub use routing::RoutingValue;
pub use storage::{StorageKey, TypedStore};
pub use types::*;
