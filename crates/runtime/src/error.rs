//! Runtime errors
//!
//! Fatal-for-instance conditions are errors; the caller marks the owning
//! instance or emitter `Disabled` and never retries. Invariant violations
//! (index out of range, unallocated buffers, simulate-pass misuse) are
//! asserts by design, not error values.

use thiserror::Error;

use crate::types::{InstanceHandle, SchedulingGroup, ScriptId};

/// Runtime result type
pub type Result<T> = std::result::Result<T, Error>;

/// Runtime errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("script {0} is not ready")]
    ScriptNotReady(ScriptId),

    #[error("attribute mismatch in {script}: {message}")]
    AttributeMismatch { script: ScriptId, message: String },

    #[error("data interface {interface} failed to bind in {script}")]
    BindFailure { script: ScriptId, interface: String },

    #[error("script {0} execution failed")]
    ExecutionFailed(ScriptId),

    #[error("execution context for {0} is not ready")]
    ContextNotReady(ScriptId),

    #[error("projection layout mismatch: {0}")]
    ProjectionMismatch(String),

    #[error("stale instance handle {0:?}")]
    StaleHandle(InstanceHandle),

    #[error("unknown instance {0}")]
    UnknownInstance(crate::types::InstanceId),

    #[error("instance {0} cannot perform this operation in its current state")]
    InvalidInstanceState(crate::types::InstanceId),

    #[error("no simulation registered for {0}")]
    UnknownGroup(SchedulingGroup),

    #[error("unknown system {0}")]
    UnknownSystem(crate::types::SystemId),

    #[error("frame graph error: {0}")]
    Graph(#[from] emberfall_taskgraph::Error),
}
