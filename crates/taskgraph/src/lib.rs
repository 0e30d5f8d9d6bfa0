//! Emberfall Task Graph
//!
//! Builds and executes per-frame task DAGs with explicit dependency edges
//! and per-task thread affinity.

pub mod error;
pub mod executor;
pub mod graph;

pub use error::{Error, Result};
pub use executor::{CompletionEvent, FrameExecutor, MainThreadQueue};
pub use graph::{Affinity, FrameGraph, GraphBuilder, TaskId, TaskNode};
