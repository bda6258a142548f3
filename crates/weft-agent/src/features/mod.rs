//! Features shipped with the crate.

pub mod event_stream;

pub use event_stream::{EventStream, EventStreamConfig};
