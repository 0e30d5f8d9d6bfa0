//! Emitter instances
//!
//! An [`EmitterInstance`] is the per-instance simulation state for one
//! emitter: its particle DataSet, the event DataSets it produces, and one
//! execution context per script role. It owns the tick state machine:
//! PreTick (context maintenance), Tick (spawn counting + script execution),
//! PostTick (bounds + previous-value priming), HandleCompletion.

use std::sync::Arc;

use tracing::{debug, error, instrument, warn};

use crate::data_set::{DataSet, DataSetLayout};
use crate::gpu::{GpuBatcher, GpuComputeContext};
use crate::param_store::{ParameterStore, StoreBinding};
use crate::script::{
    CompiledScript, ContextState, DataInterface, ScriptExecutionContext, SlotData,
};
use crate::types::{Bounds, Dt, EmitterId, ExecutionState, SimConfig};

/// One deterministic per-frame spawn-rate entry (particles per second)
#[derive(Debug, Clone, Copy)]
pub struct SpawnRateEntry {
    pub rate: f32,
}

/// How an event handler consumes incoming events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    /// Once over the whole batch of newly spawned rows
    Batch,
    /// Once per incoming event
    EveryParticle,
}

/// A handler consuming another emitter's event output.
///
/// The producer must precede the consumer in the instance's emitter list;
/// ordering is enforced by static list order, not dynamic tracking.
#[derive(Debug, Clone)]
pub struct EventHandlerSpec {
    /// Index of the producer emitter within the owning instance
    pub source_emitter: usize,
    /// Which of the producer's event sets to read
    pub source_event: usize,
    pub spawn_per_event: u32,
    pub mode: EventMode,
    pub script: Arc<CompiledScript>,
}

/// Where an emitter's bounds come from each frame
#[derive(Debug, Clone, Copy)]
pub enum BoundsMode {
    /// Caller-supplied override, recomputed never
    FixedOverride(Bounds),
    /// Fixed bound cached from the asset
    CachedFixed(Bounds),
    /// Computed over current row positions every PostTick
    Dynamic,
}

/// Static description of one emitter within a system definition
pub struct EmitterSpec {
    pub id: EmitterId,
    pub particle_layout: DataSetLayout,
    pub spawn_script: Arc<CompiledScript>,
    pub update_script: Arc<CompiledScript>,
    pub gpu_script: Option<Arc<CompiledScript>>,
    /// Event sets this emitter produces (bound to the update script as
    /// satellite slots 1..)
    pub event_layouts: Vec<DataSetLayout>,
    pub event_handlers: Vec<EventHandlerSpec>,
    pub spawn_rate: Vec<SpawnRateEntry>,
    /// Hard per-frame allocation ceiling; falls back to the config default
    pub spawn_ceiling: Option<u32>,
    pub bounds_mode: BoundsMode,
    pub interfaces: Vec<Arc<dyn DataInterface>>,
    /// High-water estimate seeding particle storage growth
    pub estimated_particles: usize,
}

impl std::fmt::Debug for EmitterSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmitterSpec")
            .field("id", &self.id)
            .field("event_handlers", &self.event_handlers.len())
            .field("spawn_rate", &self.spawn_rate)
            .finish()
    }
}

const PARAM_DELTA_TIME: &str = "DeltaTime";
const PARAM_SPAWN_COUNT: &str = "SpawnCount";

fn set_f32_if_present(store: &mut ParameterStore, name: &str, value: f32) {
    if store.layout().param(name).is_some() {
        store.set_f32(name, value);
    }
}

fn set_i32_if_present(store: &mut ParameterStore, name: &str, value: i32) {
    if store.layout().param(name).is_some() {
        store.set_i32(name, value);
    }
}

/// Every attribute a script declares must resolve to a layout column of the
/// same type; a mismatch is fatal for the emitter.
fn check_attributes(script: &CompiledScript, layout: &DataSetLayout) -> crate::Result<()> {
    for attr in &script.attributes {
        let column = layout
            .column_index(&attr.name)
            .map(|i| &layout.columns()[i]);
        match column {
            Some(column) if column.ty == attr.ty => {}
            Some(_) => {
                return Err(crate::Error::AttributeMismatch {
                    script: script.id.clone(),
                    message: format!("attribute {} has the wrong column type", attr.name),
                });
            }
            None => {
                return Err(crate::Error::AttributeMismatch {
                    script: script.id.clone(),
                    message: format!("attribute {} is not in the particle layout", attr.name),
                });
            }
        }
    }
    Ok(())
}

/// Per-instance simulation state for one emitter.
pub struct EmitterInstance {
    spec: Arc<EmitterSpec>,
    particles: DataSet,
    events: Vec<DataSet>,
    spawn_ctx: ScriptExecutionContext,
    update_ctx: ScriptExecutionContext,
    event_ctxs: Vec<ScriptExecutionContext>,
    gpu_ctx: Option<ScriptExecutionContext>,
    exec_state: ExecutionState,
    tick_count: u64,
    pending_reset: bool,
    rate_remainders: Vec<f32>,
    total_spawned: u64,
    overflow_dropped: u64,
    dropped_this_tick: u64,
    spawn_count_override: Option<u32>,
    bounds: Bounds,
    instance_bindings: Vec<StoreBinding>,
}

impl EmitterInstance {
    /// Build the instance and bind every script context. Any init failure is
    /// fatal: the emitter comes up `Disabled` and stays there.
    pub fn new(spec: Arc<EmitterSpec>) -> Self {
        let particles = DataSet::new(spec.particle_layout.clone(), spec.estimated_particles.max(1));
        let events = spec
            .event_layouts
            .iter()
            .map(|layout| DataSet::new(layout.clone(), 16))
            .collect();

        let mut instance = Self {
            particles,
            events,
            spawn_ctx: ScriptExecutionContext::new(),
            update_ctx: ScriptExecutionContext::new(),
            event_ctxs: spec
                .event_handlers
                .iter()
                .map(|_| ScriptExecutionContext::new())
                .collect(),
            gpu_ctx: spec.gpu_script.as_ref().map(|_| ScriptExecutionContext::new()),
            exec_state: ExecutionState::Active,
            tick_count: 0,
            pending_reset: false,
            rate_remainders: vec![0.0; spec.spawn_rate.len()],
            total_spawned: 0,
            overflow_dropped: 0,
            dropped_this_tick: 0,
            spawn_count_override: None,
            bounds: Bounds::EMPTY,
            instance_bindings: Vec::new(),
            spec,
        };

        if let Err(e) = instance.init_contexts() {
            error!(emitter = %instance.spec.id, error = %e, "emitter init failed");
            instance.exec_state = ExecutionState::Disabled;
        }
        let context_count = 2 + instance.event_ctxs.len() + usize::from(instance.gpu_ctx.is_some());
        instance.instance_bindings = (0..context_count).map(|_| StoreBinding::new()).collect();
        instance
    }

    fn init_contexts(&mut self) -> crate::Result<()> {
        let interfaces = &self.spec.interfaces;
        check_attributes(&self.spec.spawn_script, &self.spec.particle_layout)?;
        check_attributes(&self.spec.update_script, &self.spec.particle_layout)?;
        self.spawn_ctx
            .init(self.spec.spawn_script.clone(), interfaces.clone())?;
        self.update_ctx
            .init(self.spec.update_script.clone(), interfaces.clone())?;
        for (ctx, handler) in self.event_ctxs.iter_mut().zip(&self.spec.event_handlers) {
            check_attributes(&handler.script, &self.spec.particle_layout)?;
            ctx.init(handler.script.clone(), interfaces.clone())?;
        }
        if let (Some(ctx), Some(script)) = (self.gpu_ctx.as_mut(), self.spec.gpu_script.clone()) {
            check_attributes(&script, &self.spec.particle_layout)?;
            ctx.init(script, interfaces.clone())?;
        }
        Ok(())
    }

    pub fn spec(&self) -> &Arc<EmitterSpec> {
        &self.spec
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.exec_state
    }

    pub fn num_particles(&self) -> usize {
        self.particles.num_rows()
    }

    pub fn particles(&self) -> &DataSet {
        &self.particles
    }

    pub fn event_rows(&self, index: usize) -> usize {
        self.events[index].num_rows()
    }

    pub fn event_data(&self, index: usize) -> &DataSet {
        &self.events[index]
    }

    pub fn total_spawned(&self) -> u64 {
        self.total_spawned
    }

    /// Spawns the ceiling discarded in the most recent tick
    pub fn overflow_dropped_this_tick(&self) -> u64 {
        self.dropped_this_tick
    }

    pub fn overflow_dropped(&self) -> u64 {
        self.overflow_dropped
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Projected per-frame spawn count from the system-level script;
    /// replaces rate-derived counts for the next tick.
    pub fn set_spawn_count_override(&mut self, count: u32) {
        self.spawn_count_override = Some(count);
    }

    /// Execution-state projection from the system-level script. Disabled is
    /// terminal and Complete is sticky; those are never overridden here.
    pub fn set_execution_state(&mut self, state: ExecutionState) {
        if self.exec_state.is_terminal() {
            return;
        }
        if self.exec_state == ExecutionState::Complete && state != ExecutionState::Complete {
            return;
        }
        if self.exec_state != state {
            debug!(emitter = %self.spec.id, ?state, "execution state change");
            self.exec_state = state;
        }
    }

    fn contexts_mut(&mut self) -> impl Iterator<Item = &mut ScriptExecutionContext> {
        [&mut self.spawn_ctx, &mut self.update_ctx]
            .into_iter()
            .chain(self.event_ctxs.iter_mut())
            .chain(self.gpu_ctx.iter_mut())
    }

    /// Fan instance-level parameters into every script context's store.
    pub fn propagate_instance_parameters(&mut self, parent: &ParameterStore) {
        let bindings = std::mem::take(&mut self.instance_bindings);
        let mut bindings_iter = bindings.into_iter();
        let mut applied = Vec::new();
        for ctx in self.contexts_mut() {
            let mut binding = bindings_iter.next().unwrap_or_default();
            binding.propagate(parent, ctx.parameters_mut());
            applied.push(binding);
        }
        self.instance_bindings = applied;
    }

    fn disable(&mut self, reason: &str) {
        error!(emitter = %self.spec.id, reason, "emitter disabled");
        self.exec_state = ExecutionState::Disabled;
    }

    /// Tick every execution context; a bind failure forces Disabled for the
    /// emitter's remaining lifetime. On the very first tick an extra
    /// previous-value priming runs so interpolating scripts see sane history.
    /// Returns false if the emitter became (or already was) Disabled.
    pub fn pre_tick(&mut self) -> bool {
        if self.exec_state.is_terminal() {
            return false;
        }
        if self.pending_reset {
            self.particles.reset();
            for event in &mut self.events {
                event.reset();
            }
            self.rate_remainders.iter_mut().for_each(|r| *r = 0.0);
            self.bounds = Bounds::EMPTY;
            self.pending_reset = false;
            debug!(emitter = %self.spec.id, "reset applied");
        }

        let first_tick = self.tick_count == 0;
        let mut failed = false;
        for ctx in self.contexts_mut() {
            if !ctx.tick() {
                failed = true;
                break;
            }
            if first_tick {
                ctx.prime_previous();
            }
        }
        if failed {
            self.disable("script bind failure");
            return false;
        }
        true
    }

    fn accumulate_rate_spawns(&mut self, dt: f32) -> u32 {
        let mut count = 0u32;
        for (entry, remainder) in self.spec.spawn_rate.iter().zip(&mut self.rate_remainders) {
            let accumulated = entry.rate * dt + *remainder;
            let whole = accumulated.floor().max(0.0);
            *remainder = accumulated - whole;
            count += whole as u32;
        }
        count
    }

    /// Advance the emitter one frame. `producers` are the emitters earlier
    /// in the owning instance's list; they have already ticked this frame,
    /// so their event outputs carry frame-N counts.
    #[instrument(skip_all, fields(emitter = %self.spec.id))]
    pub fn tick(&mut self, dt: Dt, producers: &[EmitterInstance], config: &SimConfig) {
        self.dropped_this_tick = 0;
        if matches!(
            self.exec_state,
            ExecutionState::Disabled | ExecutionState::Complete
        ) {
            return;
        }

        // Event sets are per-frame: consumers downstream read this frame's
        // rows, never a prior frame's, whatever state this producer is in.
        for event in &mut self.events {
            event.reset();
        }

        match self.exec_state {
            ExecutionState::Inactive => return,
            ExecutionState::InactiveClear => {
                self.particles.reset();
                self.exec_state = ExecutionState::Inactive;
                return;
            }
            _ => {}
        }

        let regular_requested = match self.spawn_count_override.take() {
            Some(count) => count,
            None => self.accumulate_rate_spawns(dt.seconds()),
        };

        let mut event_requests: Vec<(usize, usize, u64)> = Vec::new();
        for (idx, handler) in self.spec.event_handlers.iter().enumerate() {
            let producer = &producers[handler.source_emitter];
            let incoming = producer.event_rows(handler.source_event);
            let requested = (incoming as u64).saturating_mul(u64::from(handler.spawn_per_event));
            event_requests.push((idx, incoming, requested));
        }

        // Hard per-frame ceiling: overflow drops the excess, reported, never retried.
        let ceiling = self.spec.spawn_ceiling.unwrap_or(config.default_spawn_ceiling);
        let mut budget = ceiling;
        let regular = regular_requested.min(budget);
        budget -= regular;
        let mut allowed_events: Vec<(usize, usize, u32)> = Vec::new();
        let mut total_requested = u64::from(regular_requested);
        let mut total_allowed = u64::from(regular);
        for (idx, incoming, requested) in event_requests {
            let handler = &self.spec.event_handlers[idx];
            let mut allowed = requested.min(u64::from(budget)) as u32;
            // Per-event execution binds spawn_per_event rows per source row,
            // so a clamped allowance is rounded down to whole events.
            if matches!(handler.mode, EventMode::EveryParticle) && handler.spawn_per_event > 0 {
                allowed -= allowed % handler.spawn_per_event;
            }
            budget -= allowed;
            total_requested += requested;
            total_allowed += u64::from(allowed);
            allowed_events.push((idx, incoming, allowed));
        }
        if total_requested > total_allowed {
            let dropped = total_requested - total_allowed;
            self.overflow_dropped += dropped;
            self.dropped_this_tick += dropped;
            warn!(
                emitter = %self.spec.id,
                requested = total_requested,
                allowed = total_allowed,
                ceiling,
                "spawn ceiling exceeded, dropping excess"
            );
        }

        let existing = self.particles.num_rows();
        self.particles.begin_simulate();
        self.particles
            .allocate(existing + total_allowed as usize, true);
        let result = self.run_scripts(dt, existing, regular, &allowed_events, producers);
        self.particles.end_simulate();
        if let Err(e) = result {
            self.disable(&e.to_string());
        }
    }

    fn run_scripts(
        &mut self,
        dt: Dt,
        existing: usize,
        regular_spawns: u32,
        allowed_events: &[(usize, usize, u32)],
        producers: &[EmitterInstance],
    ) -> crate::Result<()> {
        // Update over existing rows; event sets ride along as satellite slots
        // so the script can emit events.
        if existing > 0 {
            set_f32_if_present(self.update_ctx.parameters_mut(), PARAM_DELTA_TIME, dt.seconds());
            self.update_ctx.bind_data(0, 0, true);
            let mut slots = vec![SlotData::Mut(&mut self.particles)];
            for (i, event) in self.events.iter_mut().enumerate() {
                self.update_ctx.bind_data(1 + i, 0, false);
                slots.push(SlotData::Mut(event));
            }
            self.update_ctx.execute(slots, existing, dt.seconds(), &[])?;
        }

        // Regular spawns first, then per-event-handler spawns, each
        // re-binding the row-count parameter before executing.
        if regular_spawns > 0 {
            let range = self.particles.append_rows(regular_spawns as usize);
            set_i32_if_present(
                self.spawn_ctx.parameters_mut(),
                PARAM_SPAWN_COUNT,
                regular_spawns as i32,
            );
            set_f32_if_present(self.spawn_ctx.parameters_mut(), PARAM_DELTA_TIME, dt.seconds());
            self.spawn_ctx.bind_data(0, range.start, true);
            self.spawn_ctx.execute(
                vec![SlotData::Mut(&mut self.particles)],
                regular_spawns as usize,
                dt.seconds(),
                &[],
            )?;
            self.total_spawned += u64::from(regular_spawns);
        }

        for &(handler_idx, incoming, count) in allowed_events {
            if count == 0 {
                continue;
            }
            let handler = &self.spec.event_handlers[handler_idx];
            let range = self.particles.append_rows(count as usize);
            set_i32_if_present(self.spawn_ctx.parameters_mut(), PARAM_SPAWN_COUNT, count as i32);
            self.spawn_ctx.bind_data(0, range.start, true);
            self.spawn_ctx.execute(
                vec![SlotData::Mut(&mut self.particles)],
                count as usize,
                dt.seconds(),
                &[],
            )?;
            self.total_spawned += u64::from(count);

            let source = producers[handler.source_emitter].event_data(handler.source_event);
            let ctx = &mut self.event_ctxs[handler_idx];
            match handler.mode {
                EventMode::Batch => {
                    ctx.bind_data(0, range.start, true);
                    ctx.bind_data(1, 0, true);
                    ctx.execute(
                        vec![SlotData::Mut(&mut self.particles), SlotData::Shared(source)],
                        count as usize,
                        dt.seconds(),
                        &[],
                    )?;
                }
                EventMode::EveryParticle => {
                    let per_event = handler.spawn_per_event as usize;
                    // A clamped allowance covers only the leading events.
                    let events_fit = if per_event == 0 {
                        0
                    } else {
                        incoming.min(count as usize / per_event)
                    };
                    for event_row in 0..events_fit {
                        ctx.bind_data(0, range.start + event_row * per_event, true);
                        ctx.bind_data(1, event_row, true);
                        ctx.execute(
                            vec![SlotData::Mut(&mut self.particles), SlotData::Shared(source)],
                            per_event,
                            dt.seconds(),
                            &[],
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    fn dynamic_bounds(&self) -> Bounds {
        let layout = self.particles.layout();
        let columns = [
            layout.column_index("Position.X"),
            layout.column_index("Position.Y"),
            layout.column_index("Position.Z"),
        ];
        let mut bounds = Bounds::EMPTY;
        for row in 0..self.particles.num_rows() {
            let mut point = [0.0f32; 3];
            for (axis, column) in columns.iter().enumerate() {
                if let Some(column) = column {
                    point[axis] = self.particles.get_f32(*column, row);
                }
            }
            bounds.extend(point);
        }
        bounds
    }

    /// Recompute bounds and prime previous-frame constants.
    pub fn post_tick(&mut self) {
        if self.exec_state.is_terminal() {
            return;
        }
        self.bounds = match self.spec.bounds_mode {
            BoundsMode::FixedOverride(bounds) => bounds,
            BoundsMode::CachedFixed(bounds) => bounds,
            BoundsMode::Dynamic => self.dynamic_bounds(),
        };
        for ctx in self.contexts_mut() {
            ctx.post_tick();
        }
        self.tick_count += 1;
    }

    /// Enqueue this frame's GPU work, if the emitter has a GPU script.
    pub fn enqueue_gpu(&mut self, batcher: &mut dyn GpuBatcher) {
        let Some(ctx) = self.gpu_ctx.as_ref() else {
            return;
        };
        if ctx.state() != ContextState::Ready || !self.exec_state.is_simulating() {
            return;
        }
        batcher.enqueue(GpuComputeContext {
            emitter: self.spec.id.clone(),
            num_rows: self.particles.num_rows(),
            constants: ctx.parameters().bytes().to_vec(),
        });
    }

    /// Transition to Complete and clear buffers. Once Complete, ticking is a
    /// no-op until an explicit external reset. Returns whether Complete.
    pub fn handle_completion(&mut self, force: bool) -> bool {
        match self.exec_state {
            ExecutionState::Disabled => return false,
            ExecutionState::Complete => return true,
            _ => {}
        }
        let naturally_done =
            self.exec_state == ExecutionState::Inactive && self.particles.num_rows() == 0;
        if force || naturally_done {
            debug!(emitter = %self.spec.id, force, "emitter complete");
            self.exec_state = ExecutionState::Complete;
            self.particles.reset();
            for event in &mut self.events {
                event.reset();
            }
        }
        self.exec_state == ExecutionState::Complete
    }

    /// Full reset: clears buffers on the next PreTick and reactivates.
    /// Disabled is terminal and unaffected.
    pub fn reset(&mut self) {
        if self.exec_state.is_terminal() {
            return;
        }
        self.exec_state = ExecutionState::Active;
        self.pending_reset = true;
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::data_set::{ColumnDesc, ColumnType};
    use crate::param_store::ParameterLayout;
    use crate::script::test_support::{FnVm, StubInterface};
    use crate::script::{ScriptAttribute, ScriptRole, VmArgs};
    use std::sync::atomic::Ordering;

    fn config() -> SimConfig {
        SimConfig::default()
    }

    fn frame(emitter: &mut EmitterInstance, dt: f32) {
        assert!(emitter.pre_tick());
        emitter.tick(Dt(dt), &[], &config());
        emitter.post_tick();
    }

    #[test]
    fn test_constant_rate_spawns_one_per_tick() {
        // 10/sec at dt=0.1 yields exactly one new row per tick.
        let mut emitter = EmitterInstance::new(basic_spec(10.0));
        let mut expected_total = 0u64;
        for tick in 1..=20 {
            frame(&mut emitter, 0.1);
            expected_total = tick;
            assert_eq!(emitter.num_particles(), tick as usize);
            assert_eq!(emitter.total_spawned(), expected_total);
        }
        // Monotonic total-spawned counter
        assert_eq!(emitter.total_spawned(), expected_total);
        assert_eq!(emitter.overflow_dropped(), 0);
    }

    #[test]
    fn test_spawn_ceiling_drops_excess() {
        let mut spec = basic_spec(1_000_000.0);
        Arc::get_mut(&mut spec).unwrap().spawn_ceiling = Some(100);
        let mut emitter = EmitterInstance::new(spec);
        frame(&mut emitter, 1.0);
        // spawned == ceiling, never requested
        assert_eq!(emitter.num_particles(), 100);
        assert_eq!(emitter.total_spawned(), 100);
        assert_eq!(emitter.overflow_dropped(), 1_000_000 - 100);
    }

    #[test]
    fn test_update_runs_before_spawn() {
        // After two frames the first particle has aged exactly one dt and the
        // second not at all: spawn runs over newly appended rows only.
        let mut emitter = EmitterInstance::new(basic_spec(10.0));
        frame(&mut emitter, 0.1);
        frame(&mut emitter, 0.1);
        let age = emitter.particles().layout().column_index("Age").unwrap();
        let ages: Vec<f32> = (0..2).map(|r| emitter.particles().get_f32(age, r)).collect();
        let mut sorted = ages.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(sorted, vec![0.0, 0.1]);
    }

    #[test]
    fn test_shrinking_update_never_grows_rows() {
        let shrink_update = Arc::new(CompiledScript::new(
            "shrink.update",
            ScriptRole::ParticleUpdate,
            ParameterLayout::empty(),
            Arc::new(FnVm(|args: &mut VmArgs<'_, '_>| {
                let data = args.slots[0].data.get_mut().unwrap();
                let rows = data.active_rows();
                if rows > 0 {
                    data.truncate(rows - 1);
                }
                true
            })),
        ));
        let mut spec = basic_spec(20.0);
        Arc::get_mut(&mut spec).unwrap().update_script = shrink_update;
        let mut emitter = EmitterInstance::new(spec);

        for _ in 0..10 {
            let before = emitter.num_particles();
            assert!(emitter.pre_tick());
            emitter.tick(Dt(0.1), &[], &config());
            emitter.post_tick();
            // Update delta is <= 0; only spawn appends afterwards (2/tick here).
            let spawned = 2;
            let update_delta = emitter.num_particles() as i64 - spawned - before as i64;
            assert!(update_delta <= 0, "update grew rows: {update_delta}");
        }
    }

    #[test]
    fn test_attribute_mismatch_disables_emitter() {
        // "Age" is a float column; an int32 declaration must not bind.
        let update = Arc::new(
            CompiledScript::new(
                "attr.update",
                ScriptRole::ParticleUpdate,
                ParameterLayout::empty(),
                Arc::new(FnVm(|_args: &mut VmArgs<'_, '_>| true)),
            )
            .with_attributes(vec![ScriptAttribute {
                name: "Age".to_string(),
                ty: ColumnType::Int32,
            }]),
        );
        let mut spec = basic_spec(10.0);
        Arc::get_mut(&mut spec).unwrap().update_script = update;
        let emitter = EmitterInstance::new(spec);
        assert_eq!(emitter.execution_state(), ExecutionState::Disabled);

        // An attribute with no layout column at all is equally fatal.
        let spawn = Arc::new(
            CompiledScript::new(
                "attr.spawn",
                ScriptRole::ParticleSpawn,
                ParameterLayout::empty(),
                Arc::new(FnVm(|_args: &mut VmArgs<'_, '_>| true)),
            )
            .with_attributes(vec![ScriptAttribute {
                name: "Velocity.X".to_string(),
                ty: ColumnType::Float,
            }]),
        );
        let mut spec = basic_spec(10.0);
        Arc::get_mut(&mut spec).unwrap().spawn_script = spawn;
        let emitter = EmitterInstance::new(spec);
        assert_eq!(emitter.execution_state(), ExecutionState::Disabled);
    }

    #[test]
    fn test_bind_failure_disables_permanently() {
        let interface = StubInterface::new("Mesh");
        let update = Arc::new(
            CompiledScript::new(
                "di.update",
                ScriptRole::ParticleUpdate,
                ParameterLayout::empty(),
                Arc::new(FnVm(|_args: &mut VmArgs<'_, '_>| true)),
            )
            .with_data_interfaces(vec!["Mesh".to_string()]),
        );
        let mut spec = basic_spec(10.0);
        {
            let spec_mut = Arc::get_mut(&mut spec).unwrap();
            spec_mut.update_script = update;
            spec_mut.interfaces = vec![interface.clone()];
        }
        let mut emitter = EmitterInstance::new(spec);
        frame(&mut emitter, 0.1);
        assert_eq!(emitter.execution_state(), ExecutionState::Active);

        interface.shape.store(9, Ordering::SeqCst);
        interface.bind_ok.store(false, Ordering::SeqCst);
        assert!(!emitter.pre_tick());
        assert_eq!(emitter.execution_state(), ExecutionState::Disabled);

        // Disabled survives reset
        emitter.reset();
        assert_eq!(emitter.execution_state(), ExecutionState::Disabled);
        assert!(!emitter.pre_tick());
    }

    #[test]
    fn test_complete_is_sticky_until_reset() {
        let mut emitter = EmitterInstance::new(basic_spec(10.0));
        frame(&mut emitter, 0.1);
        assert!(emitter.handle_completion(true));
        assert_eq!(emitter.execution_state(), ExecutionState::Complete);
        assert_eq!(emitter.num_particles(), 0);

        // Ticking while Complete is a no-op
        assert!(emitter.pre_tick());
        emitter.tick(Dt(0.1), &[], &config());
        assert_eq!(emitter.num_particles(), 0);

        // Projection cannot un-complete it
        emitter.set_execution_state(ExecutionState::Active);
        assert_eq!(emitter.execution_state(), ExecutionState::Complete);

        // Explicit reset re-arms the emitter
        emitter.reset();
        frame(&mut emitter, 0.1);
        assert_eq!(emitter.num_particles(), 1);
    }

    #[test]
    fn test_inactive_clear_clears_and_parks() {
        let mut emitter = EmitterInstance::new(basic_spec(10.0));
        frame(&mut emitter, 0.1);
        assert_eq!(emitter.num_particles(), 1);

        emitter.set_execution_state(ExecutionState::InactiveClear);
        assert!(emitter.pre_tick());
        emitter.tick(Dt(0.1), &[], &config());
        assert_eq!(emitter.execution_state(), ExecutionState::Inactive);
        assert_eq!(emitter.num_particles(), 0);

        // Active <-> Inactive is freely reversible
        emitter.set_execution_state(ExecutionState::Active);
        frame(&mut emitter, 0.1);
        assert_eq!(emitter.num_particles(), 1);
    }

    #[test]
    fn test_dynamic_bounds_cover_positions() {
        let positioned_spawn = Arc::new(CompiledScript::new(
            "pos.spawn",
            ScriptRole::ParticleSpawn,
            ParameterLayout::new(&[("SpawnCount", 4)]),
            Arc::new(FnVm(|args: &mut VmArgs<'_, '_>| {
                let start = args.slots[0].start_row;
                let data = args.slots[0].data.get_mut().unwrap();
                for row in start..start + args.num_rows {
                    data.set_f32(0, row, row as f32); // Position.X
                    data.set_f32(1, row, -(row as f32)); // Position.Y
                }
                true
            })),
        ));
        let mut spec = basic_spec(30.0);
        Arc::get_mut(&mut spec).unwrap().spawn_script = positioned_spawn;
        let mut emitter = EmitterInstance::new(spec);
        frame(&mut emitter, 0.1);
        let bounds = emitter.bounds();
        assert_eq!(bounds.min[0], 0.0);
        assert_eq!(bounds.max[0], 2.0);
        assert_eq!(bounds.min[1], -2.0);
    }

    #[test]
    fn test_spawn_count_override_replaces_rate() {
        let mut emitter = EmitterInstance::new(basic_spec(10.0));
        emitter.set_spawn_count_override(5);
        frame(&mut emitter, 0.1);
        assert_eq!(emitter.num_particles(), 5);
        // Override is one-shot; the next tick falls back to the rate.
        frame(&mut emitter, 0.1);
        assert_eq!(emitter.num_particles(), 6);
    }
}
