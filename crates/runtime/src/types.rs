//! Core runtime types
//!
//! Identity, state, and configuration types shared across the scheduler.

use std::fmt;

/// Unique identifier for a system definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemId(pub String);

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SystemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for an emitter within a system definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EmitterId(pub String);

impl fmt::Display for EmitterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EmitterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a compiled script
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptId(pub String);

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ScriptId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stable identity for one running system instance, valid across
/// scheduling-group transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle into one simulation's instance arena.
///
/// Generational: stale handles are detected, never dereferenced. A handle is
/// only valid within the simulation that issued it; cross-group transfers
/// issue a new handle (look instances up by [`InstanceId`] instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    pub index: u32,
    pub generation: u32,
}

/// Coarse ordering bucket determining when a simulation's per-frame work runs
/// relative to other simulations. Lower groups run earlier in the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchedulingGroup(pub u8);

impl fmt::Display for SchedulingGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group{}", self.0)
    }
}

/// Per-emitter execution state.
///
/// `Disabled` is terminal: it is reachable only via init failure or an
/// unrecoverable script-bind failure and survives resets. `Complete` is
/// sticky until a full reset. `Active` and `Inactive` are freely reversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Active,
    Inactive,
    /// Inactive, with buffers cleared on the next tick
    InactiveClear,
    Complete,
    Disabled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Disabled)
    }

    /// Whether the emitter runs scripts this frame
    pub fn is_simulating(&self) -> bool {
        matches!(self, ExecutionState::Active)
    }

    /// Encoding used when the state travels through a DataSet column
    pub fn to_i32(self) -> i32 {
        match self {
            ExecutionState::Active => 0,
            ExecutionState::Inactive => 1,
            ExecutionState::InactiveClear => 2,
            ExecutionState::Complete => 3,
            ExecutionState::Disabled => 4,
        }
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(ExecutionState::Active),
            1 => Some(ExecutionState::Inactive),
            2 => Some(ExecutionState::InactiveClear),
            3 => Some(ExecutionState::Complete),
            4 => Some(ExecutionState::Disabled),
            _ => None,
        }
    }
}

/// Container membership of a system instance within its simulation.
///
/// An instance holds exactly one membership at a time. `Spawning` is
/// transient and only observed during the spawn sub-phase of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Active,
    Spawning,
    Paused,
    /// Removed from all tick containers; permanent until destroyed
    Disabled,
}

/// Time step for the current frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dt(pub f32);

impl Dt {
    pub fn seconds(&self) -> f32 {
        self.0
    }
}

/// Context describing one frame of one simulation
#[derive(Debug, Clone)]
pub struct TickInfo {
    pub frame: u64,
    pub dt: Dt,
    pub group: SchedulingGroup,
}

/// Scheduler configuration, injected at construction.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of consecutive active instances per dispatch batch
    pub batch_size: usize,
    /// Instance count at or above which Phase B parameter work parallelizes
    pub parallel_projection_threshold: usize,
    /// Instance count at or above which the async frame path is considered
    pub async_min_instances: usize,
    /// Master switch for the async frame path
    pub allow_async: bool,
    /// Whether worker threads are available at all
    pub threading_available: bool,
    /// Per-frame/per-emitter spawn ceiling used when a spec has none
    pub default_spawn_ceiling: u32,
    /// Delta time handed to the extra first-frame update of newly spawned
    /// instances (clamped, normally zero)
    pub first_update_dt: f32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            parallel_projection_threshold: 32,
            async_min_instances: 4,
            allow_async: true,
            threading_available: true,
            default_spawn_ceiling: 10_000,
            first_update_dt: 0.0,
        }
    }
}

/// Axis-aligned bounds for an emitter or instance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Bounds {
    pub const EMPTY: Bounds = Bounds {
        min: [f32::INFINITY; 3],
        max: [f32::NEG_INFINITY; 3],
    };

    pub fn is_empty(&self) -> bool {
        (0..3).any(|i| self.min[i] > self.max[i])
    }

    pub fn extend(&mut self, point: [f32; 3]) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(point[i]);
            self.max[i] = self.max[i].max(point[i]);
        }
    }

    pub fn union(&mut self, other: &Bounds) {
        if other.is_empty() {
            return;
        }
        self.extend(other.min);
        self.extend(other.max);
    }
}
