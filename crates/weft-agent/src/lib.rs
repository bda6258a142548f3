pub mod agent;
pub mod context;
pub mod feature;
pub mod features;
pub mod graph;
pub mod pipeline;

pub use agent::{Agent, AgentBuilder};
pub use context::{ContextBuilder, ExecutionContext, Services};
pub use feature::{Feature, FeatureKey, FeatureRegistry};
pub use features::{EventStream, EventStreamConfig};
pub use graph::{
    EdgeDef, EdgeRef, Graph, GraphBuilder, Guard, Interpreter, NodeHandler, NodeRef, ParallelNode,
    RunStatus, Transform,
};
pub use pipeline::{HookEvent, HookInstaller, HookType, NodeOutcome, Pipeline};
