//! Emberfall Runtime
//!
//! Advances many concurrently-running particle-system instances that share
//! one system definition. Each frame runs a phased protocol per simulation:
//! a game-thread intake/re-bucketing pass, a concurrent system-level script
//! pass over an aggregated per-instance data set, then batched per-instance
//! emitter ticks with game-thread finalize, all wired through an explicit
//! task graph.

pub mod data_set;
pub mod emitter;
pub mod error;
pub mod gpu;
pub mod instance;
pub mod param_store;
pub mod pool;
pub mod sched;
pub mod script;
pub mod simulation;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
