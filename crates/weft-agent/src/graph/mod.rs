//! Execution graphs: nodes connected by guarded edges, walked by an interpreter.
//!
//! A [`GraphBuilder`] collects nodes and edges and validates them into an
//! immutable [`Graph`]. The [`Interpreter`] walks a graph from its start node,
//! executing each node and following the first outgoing edge whose guard
//! accepts the node's output, until the finish node completes.

pub mod builder;
pub mod edge;
pub mod interpreter;
pub mod model;
pub mod node;
pub mod parallel;
pub mod subgraph;

pub use builder::{EdgeRef, GraphBuilder, NodeRef};
pub use edge::{Edge, EdgeDef, Guard, Transform};
pub use interpreter::{Interpreter, RunStatus};
pub use model::Graph;
pub use node::{FnNode, Node, NodeHandler, NodeKind, Passthrough, TypedNode};
pub use parallel::ParallelNode;
pub use subgraph::SubgraphNode;
