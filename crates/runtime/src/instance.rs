//! System instances
//!
//! A [`SystemInstance`] is one running copy of a system definition: an
//! instance-level parameter store plus one [`EmitterInstance`] per emitter in
//! the definition. Emitters tick strictly in definition order, so an event
//! consumer always observes its producer's counts for the current frame.

use std::sync::Arc;

use tracing::debug;

use crate::emitter::{EmitterInstance, EmitterSpec};
use crate::param_store::{ParameterLayout, ParameterStore};
use crate::script::CompiledScript;
use crate::types::{
    Bounds, Dt, ExecutionState, InstanceId, InstanceState, SchedulingGroup, SimConfig, SystemId,
};

/// Static description of a system: its emitters, the system-level scripts
/// run once per instance per frame, and the instance parameter layout.
pub struct SystemDef {
    pub id: SystemId,
    pub emitters: Vec<Arc<EmitterSpec>>,
    /// Runs over newly added instances only
    pub spawn_script: Arc<CompiledScript>,
    /// Runs over all active instances
    pub update_script: Arc<CompiledScript>,
    /// Instance-level (game-thread writable) parameter layout
    pub parameters: ParameterLayout,
    pub initial_group: SchedulingGroup,
}

impl std::fmt::Debug for SystemDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemDef")
            .field("id", &self.id)
            .field("emitters", &self.emitters.len())
            .field("initial_group", &self.initial_group)
            .finish()
    }
}

/// One running copy of a system definition.
pub struct SystemInstance {
    id: InstanceId,
    parameters: ParameterStore,
    emitters: Vec<EmitterInstance>,
    state: InstanceState,
    /// Group the owner wants this instance in
    requested_group: SchedulingGroup,
    current_group: SchedulingGroup,
    age: f32,
    tick_count: u64,
    bounds: Bounds,
}

impl SystemInstance {
    pub fn new(id: InstanceId, def: &SystemDef) -> Self {
        let emitters = def
            .emitters
            .iter()
            .map(|spec| EmitterInstance::new(spec.clone()))
            .collect();
        Self {
            id,
            parameters: ParameterStore::new(def.parameters.clone()),
            emitters,
            state: InstanceState::Pending,
            requested_group: def.initial_group,
            current_group: def.initial_group,
            age: 0.0,
            tick_count: 0,
            bounds: Bounds::EMPTY,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: InstanceState) {
        self.state = state;
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }

    /// Game-thread writable instance parameters; propagated to emitter
    /// contexts at the start of the next frame.
    pub fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.parameters
    }

    pub fn emitters(&self) -> &[EmitterInstance] {
        &self.emitters
    }

    pub fn emitters_mut(&mut self) -> &mut [EmitterInstance] {
        &mut self.emitters
    }

    pub fn current_group(&self) -> SchedulingGroup {
        self.current_group
    }

    pub fn requested_group(&self) -> SchedulingGroup {
        self.requested_group
    }

    /// Request a move to another scheduling group. Takes effect when the
    /// owning scheduler processes transfers, never mid-phase.
    pub fn request_group(&mut self, group: SchedulingGroup) {
        self.requested_group = group;
    }

    pub(crate) fn set_current_group(&mut self, group: SchedulingGroup) {
        self.current_group = group;
    }

    pub fn age(&self) -> f32 {
        self.age
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Union of this frame's emitter bounds
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Fan instance parameters into every emitter context, then clear the
    /// dirty flag so unchanged frames skip the copies.
    pub fn propagate_parameters(&mut self) {
        for emitter in &mut self.emitters {
            emitter.propagate_instance_parameters(&self.parameters);
        }
        self.parameters.clear_dirty();
    }

    /// PreTick every emitter. Returns false if any emitter hit a script bind
    /// failure this frame; the caller disables at its own granularity.
    pub fn pre_tick_emitters(&mut self) -> bool {
        let mut ok = true;
        for emitter in &mut self.emitters {
            let was_disabled = emitter.execution_state() == ExecutionState::Disabled;
            if !emitter.pre_tick() && !was_disabled {
                ok = false;
            }
        }
        ok
    }

    /// Tick emitters in definition order. Each emitter sees the slice of
    /// already-ticked emitters as event producers, so a consumer reading a
    /// producer's event set gets this frame's counts.
    pub fn tick_emitters(&mut self, dt: Dt, config: &SimConfig) {
        for i in 0..self.emitters.len() {
            let (producers, rest) = self.emitters.split_at_mut(i);
            rest[0].tick(dt, producers, config);
        }
        self.age += dt.seconds();
        self.tick_count += 1;
    }

    /// PostTick every emitter and refresh instance bounds.
    pub fn post_tick_emitters(&mut self) {
        let mut bounds = Bounds::EMPTY;
        for emitter in &mut self.emitters {
            emitter.post_tick();
            bounds.union(&emitter.bounds());
        }
        self.bounds = bounds;
    }

    /// Whether every emitter has finished (Complete or Disabled)
    pub fn is_complete(&self) -> bool {
        self.emitters.iter().all(|e| {
            matches!(
                e.execution_state(),
                ExecutionState::Complete | ExecutionState::Disabled
            )
        })
    }

    /// Permanently remove the instance from simulation.
    pub fn disable(&mut self) {
        debug!(instance = %self.id, "instance disabled");
        self.state = InstanceState::Disabled;
        for emitter in &mut self.emitters {
            emitter.handle_completion(true);
        }
    }

    /// Re-arm every emitter for a fresh run.
    pub fn reset(&mut self) {
        self.age = 0.0;
        self.tick_count = 0;
        self.bounds = Bounds::EMPTY;
        for emitter in &mut self.emitters {
            emitter.reset();
        }
    }

    /// Rebind a pooled instance to a new identity before reuse.
    pub(crate) fn reassign(&mut self, id: InstanceId) {
        self.id = id;
        self.state = InstanceState::Pending;
        self.reset();
    }

    /// Whether the instance could ever simulate again
    pub(crate) fn is_poolable(&self) -> bool {
        self.state != InstanceState::Disabled
            && self
                .emitters
                .iter()
                .all(|e| e.execution_state() != ExecutionState::Disabled)
    }
}

impl std::fmt::Debug for SystemInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemInstance")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("group", &self.current_group)
            .field("emitters", &self.emitters.len())
            .finish()
    }
}
