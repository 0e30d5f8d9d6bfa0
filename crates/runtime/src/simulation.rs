//! System simulation
//!
//! A [`SystemSimulation`] owns every running instance of one system
//! definition within one scheduling group. Per frame it runs three phases:
//!
//! * spawn phase: pending instances get a row in the system DataSet and run
//!   the system spawn script;
//! * update phase: instance parameters are projected into rows, the system
//!   update script runs over all rows at once, and results are projected
//!   back into each instance's emitters;
//! * instance ticks: emitters advance, batched and optionally offloaded to
//!   worker threads through a frame graph.
//!
//! The position of an instance in the active list always equals its row
//! index in the system DataSet. Every container mutation maintains this.

use std::sync::{Arc, Mutex, PoisonError};

use emberfall_taskgraph::{Affinity, CompletionEvent, FrameExecutor, GraphBuilder};
use rayon::prelude::*;
use tracing::{debug, error, instrument, trace};

use crate::data_set::{ColumnDesc, DataSet, DataSetLayout};
use crate::error::{Error, Result};
use crate::instance::{SystemDef, SystemInstance};
use crate::param_store::DataSetProjection;
use crate::script::{ScriptExecutionContext, SlotData};
use crate::types::{
    Dt, ExecutionState, InstanceHandle, InstanceId, InstanceState, SchedulingGroup, SimConfig,
    TickInfo,
};

const CELL: usize = 4;

/// Container membership of one arena slot. The payload of `Active` and
/// `Paused` is the position in that container's list, which for row-backed
/// containers is also the row index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Free,
    Pending(usize),
    Active(usize),
    Paused(usize),
    Disabled,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    instance: Option<SystemInstance>,
    membership: Membership,
}

/// Counters for the most recently accounted frame
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    pub frame: u64,
    pub spawned_instances: usize,
    pub ticked_instances: usize,
    pub completed_instances: usize,
    pub total_particles: usize,
    pub overflow_dropped: u64,
}

/// One batch of instances lifted out of the arena for ticking. Moving a
/// batch into the frame graph gives its worker closure `'static` ownership;
/// the per-batch finalize task hands it back for reintegration.
struct TickBatch {
    instances: Vec<(u32, SystemInstance)>,
}

/// Tick one batch of instances. A script bind failure anywhere in the batch
/// disables the whole batch: partial batches would leave the shared dispatch
/// bookkeeping inconsistent.
fn tick_batch(chunk: &mut [(u32, SystemInstance)], dt: Dt, config: &SimConfig) {
    let mut bind_failure = false;
    for (_, instance) in chunk.iter_mut() {
        if !instance.pre_tick_emitters() {
            bind_failure = true;
        }
    }
    if bind_failure {
        error!(batch = chunk.len(), "bind failure, disabling batch");
        for (_, instance) in chunk.iter_mut() {
            instance.disable();
        }
        return;
    }
    for (_, instance) in chunk.iter_mut() {
        instance.tick_emitters(dt, config);
        instance.post_tick_emitters();
    }
}

struct InflightTick {
    /// Batches the per-batch finalize tasks have handed back, in completion
    /// order.
    done: Arc<Mutex<Vec<TickBatch>>>,
    completion: CompletionEvent,
}

/// All running instances of one system definition within one scheduling group.
pub struct SystemSimulation {
    def: Arc<SystemDef>,
    group: SchedulingGroup,
    config: SimConfig,
    slots: Vec<Slot>,
    free: Vec<u32>,
    pending: Vec<InstanceHandle>,
    active: Vec<InstanceHandle>,
    paused: Vec<InstanceHandle>,
    /// One row per active instance, in active-list order
    dataset: DataSet,
    /// Rows of paused instances, in paused-list order
    paused_rows: DataSet,
    projection: DataSetProjection,
    /// (ExecutionState column, SpawnCount column) per emitter
    emitter_columns: Vec<(usize, usize)>,
    spawn_ctx: ScriptExecutionContext,
    update_ctx: ScriptExecutionContext,
    inflight: Option<InflightTick>,
    system_ok: bool,
    stats: FrameStats,
    /// First dataset row added by this frame's spawn phase; rows at and past
    /// it receive the first-update dt instead of the frame dt.
    first_new_row: usize,
}

/// Columns backing the system scripts: one cell-column per instance
/// parameter, plus the per-emitter state and spawn-count columns the update
/// script writes its results into.
fn system_layout(def: &SystemDef) -> DataSetLayout {
    let mut columns = Vec::new();
    for param in def.parameters.params() {
        let cells = param.size / CELL;
        if cells == 1 {
            columns.push(ColumnDesc::float(&param.name));
        } else {
            for cell in 0..cells {
                columns.push(ColumnDesc::float(&format!("{}.{cell}", param.name)));
            }
        }
    }
    for emitter in &def.emitters {
        columns.push(ColumnDesc::int32(&format!("{}.ExecutionState", emitter.id)));
        columns.push(ColumnDesc::int32(&format!("{}.SpawnCount", emitter.id)));
    }
    DataSetLayout::new(columns)
}

impl SystemSimulation {
    pub fn new(def: Arc<SystemDef>, group: SchedulingGroup, config: SimConfig) -> Result<Self> {
        let layout = system_layout(&def);
        let emitter_columns = def
            .emitters
            .iter()
            .map(|e| {
                let state = layout
                    .column_index(&format!("{}.ExecutionState", e.id))
                    .ok_or_else(|| {
                        Error::ProjectionMismatch(format!("{}.ExecutionState missing", e.id))
                    })?;
                let spawn = layout
                    .column_index(&format!("{}.SpawnCount", e.id))
                    .ok_or_else(|| {
                        Error::ProjectionMismatch(format!("{}.SpawnCount missing", e.id))
                    })?;
                Ok((state, spawn))
            })
            .collect::<Result<Vec<_>>>()?;
        let projection = DataSetProjection::build(&def.parameters, &layout, None);

        let mut spawn_ctx = ScriptExecutionContext::new();
        spawn_ctx.init(def.spawn_script.clone(), vec![])?;
        let mut update_ctx = ScriptExecutionContext::new();
        update_ctx.init(def.update_script.clone(), vec![])?;

        debug!(system = %def.id, %group, "simulation created");
        Ok(Self {
            dataset: DataSet::new(layout.clone(), 16),
            paused_rows: DataSet::new(layout, 16),
            def,
            group,
            config,
            slots: Vec::new(),
            free: Vec::new(),
            pending: Vec::new(),
            active: Vec::new(),
            paused: Vec::new(),
            projection,
            emitter_columns,
            spawn_ctx,
            update_ctx,
            inflight: None,
            system_ok: true,
            stats: FrameStats::default(),
            first_new_row: 0,
        })
    }

    pub fn def(&self) -> &Arc<SystemDef> {
        &self.def
    }

    pub fn group(&self) -> SchedulingGroup {
        self.group
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn paused_count(&self) -> usize {
        self.paused.len()
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    fn slot(&self, handle: InstanceHandle) -> Result<&Slot> {
        let slot = self
            .slots
            .get(handle.index as usize)
            .ok_or(Error::StaleHandle(handle))?;
        if slot.generation != handle.generation || slot.instance.is_none() {
            return Err(Error::StaleHandle(handle));
        }
        Ok(slot)
    }

    fn slot_mut(&mut self, handle: InstanceHandle) -> Result<&mut Slot> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(Error::StaleHandle(handle))?;
        if slot.generation != handle.generation || slot.instance.is_none() {
            return Err(Error::StaleHandle(handle));
        }
        Ok(slot)
    }

    pub fn instance(&self, handle: InstanceHandle) -> Result<&SystemInstance> {
        // slot() guarantees the instance is present
        Ok(self.slot(handle)?.instance.as_ref().unwrap())
    }

    pub fn instance_mut(&mut self, handle: InstanceHandle) -> Result<&mut SystemInstance> {
        Ok(self.slot_mut(handle)?.instance.as_mut().unwrap())
    }

    fn insert_slot(&mut self, instance: SystemInstance) -> InstanceHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.instance = Some(instance);
            slot.membership = Membership::Free;
            InstanceHandle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                instance: Some(instance),
                membership: Membership::Free,
            });
            InstanceHandle {
                index,
                generation: 0,
            }
        }
    }

    /// Create an instance. It sits in the pending container until the next
    /// spawn phase assigns it a row.
    pub fn add_instance(&mut self, id: InstanceId) -> InstanceHandle {
        self.insert_pending(SystemInstance::new(id, &self.def))
    }

    /// Admit an externally built (typically pooled) instance as pending.
    pub(crate) fn insert_pending(&mut self, mut instance: SystemInstance) -> InstanceHandle {
        instance.set_current_group(self.group);
        let id = instance.id();
        let handle = self.insert_slot(instance);
        self.slots[handle.index as usize].membership = Membership::Pending(self.pending.len());
        self.pending.push(handle);
        trace!(instance = %id, ?handle, "instance added");
        handle
    }

    fn remove_pending_at(&mut self, pos: usize) {
        self.pending.swap_remove(pos);
        if pos < self.pending.len() {
            let moved = self.pending[pos];
            self.slots[moved.index as usize].membership = Membership::Pending(pos);
        }
    }

    fn remove_active_at(&mut self, pos: usize) {
        self.dataset.kill_instance(pos);
        self.active.swap_remove(pos);
        if pos < self.active.len() {
            let moved = self.active[pos];
            self.slots[moved.index as usize].membership = Membership::Active(pos);
        }
    }

    fn remove_paused_at(&mut self, pos: usize) {
        self.paused_rows.kill_instance(pos);
        self.paused.swap_remove(pos);
        if pos < self.paused.len() {
            let moved = self.paused[pos];
            self.slots[moved.index as usize].membership = Membership::Paused(pos);
        }
    }

    /// Move an active instance out of simulation, parking its row so no
    /// accumulated state is lost. Only active instances can pause.
    pub fn pause_instance(&mut self, handle: InstanceHandle) -> Result<()> {
        let membership = self.slot(handle)?.membership;
        let Membership::Active(pos) = membership else {
            let id = self.instance(handle)?.id();
            return Err(Error::InvalidInstanceState(id));
        };
        let row = self.paused_rows.transfer_instance(&mut self.dataset, pos, true);
        debug_assert_eq!(row, self.paused.len());
        self.active.swap_remove(pos);
        if pos < self.active.len() {
            let moved = self.active[pos];
            self.slots[moved.index as usize].membership = Membership::Active(pos);
        }
        let slot = &mut self.slots[handle.index as usize];
        slot.membership = Membership::Paused(row);
        let instance = slot.instance.as_mut().unwrap();
        instance.set_state(InstanceState::Paused);
        self.paused.push(handle);
        trace!(instance = %self.instance(handle)?.id(), "paused");
        Ok(())
    }

    /// Return a paused instance to simulation. Its row content comes back
    /// exactly as parked; its row index is freshly assigned at the end of
    /// the active list.
    pub fn resume_instance(&mut self, handle: InstanceHandle) -> Result<()> {
        let membership = self.slot(handle)?.membership;
        let Membership::Paused(pos) = membership else {
            let id = self.instance(handle)?.id();
            return Err(Error::InvalidInstanceState(id));
        };
        let row = self.dataset.transfer_instance(&mut self.paused_rows, pos, true);
        debug_assert_eq!(row, self.active.len());
        self.paused.swap_remove(pos);
        if pos < self.paused.len() {
            let moved = self.paused[pos];
            self.slots[moved.index as usize].membership = Membership::Paused(pos);
        }
        let slot = &mut self.slots[handle.index as usize];
        slot.membership = Membership::Active(row);
        let instance = slot.instance.as_mut().unwrap();
        instance.set_state(InstanceState::Active);
        self.active.push(handle);
        trace!(instance = %self.instance(handle)?.id(), row, "resumed");
        Ok(())
    }

    /// Remove the instance entirely and free its slot. The handle (and any
    /// copy of it) is stale afterwards.
    pub fn destroy_instance(&mut self, handle: InstanceHandle) -> Result<()> {
        self.take_instance(handle).map(drop)
    }

    /// Remove the instance and hand it back, typically for pooling.
    pub(crate) fn take_instance(&mut self, handle: InstanceHandle) -> Result<SystemInstance> {
        let membership = self.slot(handle)?.membership;
        match membership {
            Membership::Pending(pos) => self.remove_pending_at(pos),
            Membership::Active(pos) => self.remove_active_at(pos),
            Membership::Paused(pos) => self.remove_paused_at(pos),
            Membership::Disabled | Membership::Free => {}
        }
        let slot = &mut self.slots[handle.index as usize];
        let instance = slot.instance.take().unwrap();
        slot.membership = Membership::Free;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(instance)
    }

    /// Move an instance into `dest`, a simulation of the same system in
    /// another group. Active instances carry their row; the destination
    /// issues a new handle.
    pub(crate) fn transfer_to(
        &mut self,
        handle: InstanceHandle,
        dest: &mut SystemSimulation,
    ) -> Result<InstanceHandle> {
        assert!(
            self.dataset.layout().is_compatible(dest.dataset.layout()),
            "transfer between different system definitions"
        );
        let membership = self.slot(handle)?.membership;
        let slot_index = handle.index as usize;
        match membership {
            Membership::Active(pos) => {
                let row = dest.dataset.transfer_instance(&mut self.dataset, pos, true);
                debug_assert_eq!(row, dest.active.len());
                self.active.swap_remove(pos);
                if pos < self.active.len() {
                    let moved = self.active[pos];
                    self.slots[moved.index as usize].membership = Membership::Active(pos);
                }
                let mut instance = self.slots[slot_index].instance.take().unwrap();
                self.slots[slot_index].membership = Membership::Free;
                self.slots[slot_index].generation = self.slots[slot_index].generation.wrapping_add(1);
                self.free.push(handle.index);
                instance.set_current_group(dest.group);
                let new_handle = dest.insert_slot(instance);
                dest.slots[new_handle.index as usize].membership = Membership::Active(row);
                dest.active.push(new_handle);
                Ok(new_handle)
            }
            Membership::Pending(pos) => {
                self.remove_pending_at(pos);
                let mut instance = self.slots[slot_index].instance.take().unwrap();
                self.slots[slot_index].membership = Membership::Free;
                self.slots[slot_index].generation = self.slots[slot_index].generation.wrapping_add(1);
                self.free.push(handle.index);
                instance.set_current_group(dest.group);
                let new_handle = dest.insert_slot(instance);
                dest.slots[new_handle.index as usize].membership =
                    Membership::Pending(dest.pending.len());
                dest.pending.push(new_handle);
                Ok(new_handle)
            }
            Membership::Paused(pos) => {
                let row = dest
                    .paused_rows
                    .transfer_instance(&mut self.paused_rows, pos, true);
                self.paused.swap_remove(pos);
                if pos < self.paused.len() {
                    let moved = self.paused[pos];
                    self.slots[moved.index as usize].membership = Membership::Paused(pos);
                }
                let mut instance = self.slots[slot_index].instance.take().unwrap();
                self.slots[slot_index].membership = Membership::Free;
                self.slots[slot_index].generation = self.slots[slot_index].generation.wrapping_add(1);
                self.free.push(handle.index);
                instance.set_current_group(dest.group);
                let new_handle = dest.insert_slot(instance);
                dest.slots[new_handle.index as usize].membership = Membership::Paused(row);
                dest.paused.push(new_handle);
                Ok(new_handle)
            }
            Membership::Disabled | Membership::Free => {
                let id = self.instance(handle)?.id();
                Err(Error::InvalidInstanceState(id))
            }
        }
    }

    /// Handles of active instances whose requested group differs from this
    /// simulation's group.
    pub(crate) fn transfer_requests(&self) -> Vec<(InstanceHandle, SchedulingGroup)> {
        let mut requests = Vec::new();
        for list in [&self.pending, &self.active, &self.paused] {
            for &handle in list.iter() {
                if let Ok(instance) = self.instance(handle) {
                    if instance.requested_group() != self.group {
                        requests.push((handle, instance.requested_group()));
                    }
                }
            }
        }
        requests
    }

    /// Spawn phase: assign a row to every pending instance, run the system
    /// spawn script over the new rows, then give each new instance its first
    /// (near zero dt) update so render state exists immediately.
    #[instrument(skip_all, fields(system = %self.def.id, group = %self.group))]
    pub fn spawn_phase(&mut self, tick: &TickInfo) {
        assert!(self.inflight.is_none(), "spawn phase with a tick in flight");
        self.stats = FrameStats {
            frame: tick.frame,
            ..FrameStats::default()
        };
        self.first_new_row = self.active.len();
        self.system_ok = self.spawn_ctx.tick() && self.update_ctx.tick();
        if !self.system_ok {
            error!(system = %self.def.id, "system script bind failure");
            return;
        }
        if self.pending.is_empty() {
            return;
        }

        let first_new_row = self.active.len();
        let new_handles = std::mem::take(&mut self.pending);
        for &handle in &new_handles {
            let row = self.dataset.push_row();
            debug_assert_eq!(row, self.active.len());
            let slot = &mut self.slots[handle.index as usize];
            slot.membership = Membership::Active(row);
            let instance = slot.instance.as_mut().unwrap();
            instance.set_state(InstanceState::Spawning);
            if !self.projection.is_valid(instance.parameters().layout(), self.dataset.layout()) {
                self.projection = DataSetProjection::build(
                    instance.parameters().layout(),
                    self.dataset.layout(),
                    None,
                );
            }
            self.projection
                .copy_to_data_set(instance.parameters(), &mut self.dataset, row);
            for &(_, spawn_col) in &self.emitter_columns {
                self.dataset.set_i32(spawn_col, row, -1);
            }
            self.active.push(handle);
        }

        let count = new_handles.len();
        self.spawn_ctx.bind_data(0, first_new_row, true);
        if let Err(e) = self.spawn_ctx.execute(
            vec![SlotData::Mut(&mut self.dataset)],
            count,
            tick.dt.seconds(),
            &[],
        ) {
            error!(system = %self.def.id, error = %e, "system spawn script failed");
            self.system_ok = false;
        }

        let first_dt = Dt(self.config.first_update_dt);
        for &handle in &new_handles {
            let slot = &mut self.slots[handle.index as usize];
            let instance = slot.instance.as_mut().unwrap();
            instance.propagate_parameters();
            if instance.pre_tick_emitters() {
                instance.tick_emitters(first_dt, &self.config);
                instance.post_tick_emitters();
                self.stats.overflow_dropped += instance
                    .emitters()
                    .iter()
                    .map(|e| e.overflow_dropped_this_tick())
                    .sum::<u64>();
            }
            instance.set_state(InstanceState::Active);
        }
        self.stats.spawned_instances = count;
        debug!(count, "instances spawned");
    }

    /// Update phase: project instance parameters into rows, run the system
    /// update script once over every row, and project the resulting per
    /// emitter execution states and spawn counts back into the instances.
    #[instrument(skip_all, fields(system = %self.def.id, group = %self.group))]
    pub fn update_phase(&mut self, tick: &TickInfo) {
        if !self.system_ok || self.active.is_empty() {
            return;
        }

        // Emitter-context fan-out is the expensive side; it parallelizes per
        // instance. Row writes stay sequential for determinism.
        if self.active.len() >= self.config.parallel_projection_threshold {
            self.slots.par_iter_mut().for_each(|slot| {
                if matches!(slot.membership, Membership::Active(_)) {
                    if let Some(instance) = slot.instance.as_mut() {
                        instance.propagate_parameters();
                    }
                }
            });
        } else {
            for &handle in &self.active {
                let instance = self.slots[handle.index as usize].instance.as_mut().unwrap();
                instance.propagate_parameters();
            }
        }
        for (row, &handle) in self.active.iter().enumerate() {
            let slot = &mut self.slots[handle.index as usize];
            let instance = slot.instance.as_ref().unwrap();
            self.projection
                .copy_to_data_set(instance.parameters(), &mut self.dataset, row);
        }

        // Rows spawned this frame get their own update pass at the
        // first-update dt so a spawn-frame instance never integrates a full
        // step.
        let seasoned = self.first_new_row.min(self.active.len());
        if seasoned > 0 {
            self.update_ctx.bind_data(0, 0, true);
            if let Err(e) = self.update_ctx.execute(
                vec![SlotData::Mut(&mut self.dataset)],
                seasoned,
                tick.dt.seconds(),
                &[],
            ) {
                error!(system = %self.def.id, error = %e, "system update script failed");
                self.system_ok = false;
                return;
            }
        }
        let fresh = self.active.len() - seasoned;
        if fresh > 0 {
            self.update_ctx.bind_data(0, seasoned, true);
            if let Err(e) = self.update_ctx.execute(
                vec![SlotData::Mut(&mut self.dataset)],
                fresh,
                self.config.first_update_dt,
                &[],
            ) {
                error!(system = %self.def.id, error = %e, "system update script failed");
                self.system_ok = false;
                return;
            }
        }

        // Back-projection. A spawn count below zero means "no override".
        for (row, &handle) in self.active.iter().enumerate() {
            for (emitter_idx, &(state_col, spawn_col)) in self.emitter_columns.iter().enumerate() {
                let state = ExecutionState::from_i32(self.dataset.get_i32(state_col, row));
                let count = self.dataset.get_i32(spawn_col, row);
                let instance = self.slots[handle.index as usize].instance.as_mut().unwrap();
                if let Some(state) = state {
                    instance.emitters_mut()[emitter_idx].set_execution_state(state);
                }
                if count >= 0 {
                    instance.emitters_mut()[emitter_idx].set_spawn_count_override(count as u32);
                    self.dataset.set_i32(spawn_col, row, -1);
                }
            }
        }
    }

    /// Lift every active instance out of the arena, grouped into fixed-size
    /// batches in active-list order.
    fn extract_batches(&mut self) -> Vec<TickBatch> {
        let batch_size = self.config.batch_size.max(1);
        let mut batches = Vec::with_capacity(self.active.len().div_ceil(batch_size));
        let mut current = Vec::with_capacity(batch_size);
        for handle in &self.active {
            let instance = self.slots[handle.index as usize].instance.take().unwrap();
            current.push((handle.index, instance));
            if current.len() == batch_size {
                batches.push(TickBatch {
                    instances: std::mem::take(&mut current),
                });
            }
        }
        if !current.is_empty() {
            batches.push(TickBatch { instances: current });
        }
        batches
    }

    fn reintegrate(&mut self, batch: TickBatch) {
        for (index, instance) in batch.instances {
            self.stats.overflow_dropped += instance
                .emitters()
                .iter()
                .map(|e| e.overflow_dropped_this_tick())
                .sum::<u64>();
            self.slots[index as usize].instance = Some(instance);
        }
    }

    /// End-of-frame bookkeeping once every instance is back in the arena:
    /// remove completed and disabled instances (their rows go with them) and
    /// settle counters.
    fn finalize_frame(&mut self) {
        let mut pos = self.active.len();
        while pos > 0 {
            pos -= 1;
            let handle = self.active[pos];
            let instance = self.slots[handle.index as usize].instance.as_mut().unwrap();
            let disabled = instance.state() == InstanceState::Disabled;
            let complete = instance.is_complete();
            if disabled || complete {
                if !disabled {
                    instance.disable();
                }
                self.remove_active_at(pos);
                self.slots[handle.index as usize].membership = Membership::Disabled;
                self.stats.completed_instances += 1;
            }
        }
        debug_assert_eq!(self.active.len(), self.dataset.num_rows());
        debug_assert_eq!(self.paused.len(), self.paused_rows.num_rows());

        let mut particles = 0;
        for &handle in &self.active {
            let instance = self.slots[handle.index as usize].instance.as_ref().unwrap();
            particles += instance.emitters().iter().map(|e| e.num_particles()).sum::<usize>();
        }
        self.stats.total_particles = particles;

        self.spawn_ctx.post_tick();
        self.update_ctx.post_tick();
    }

    /// Phase C: run every active instance's emitter ticks, batched. With an
    /// executor and enough instances the work moves to worker threads and
    /// this returns immediately; `wait_for_tick_complete` is the barrier.
    #[instrument(skip_all, fields(system = %self.def.id, group = %self.group))]
    pub fn dispatch_tick(&mut self, tick: &TickInfo, executor: Option<&FrameExecutor>) -> Result<()> {
        assert!(self.inflight.is_none(), "dispatch with a tick already in flight");
        if !self.system_ok || self.active.is_empty() {
            self.finalize_frame();
            return Ok(());
        }

        let num_ticked = self.active.len();
        let mut batches = self.extract_batches();
        self.stats.ticked_instances = num_ticked;

        let go_async = self.config.allow_async
            && self.config.threading_available
            && num_ticked >= self.config.async_min_instances;
        let Some(executor) = executor.filter(|_| go_async) else {
            let dt = tick.dt;
            let config = self.config.clone();
            batches
                .par_iter_mut()
                .for_each(|batch| tick_batch(&mut batch.instances, dt, &config));
            for batch in batches {
                self.reintegrate(batch);
            }
            self.finalize_frame();
            return Ok(());
        };

        // One worker node per batch, each feeding a main-thread finalize
        // node; the join signals once every finalize has handed its batch
        // back.
        let done: Arc<Mutex<Vec<TickBatch>>> = Arc::new(Mutex::new(Vec::new()));
        let completion = CompletionEvent::new();
        let mut builder = GraphBuilder::new();
        let mut finalize_ids = Vec::with_capacity(batches.len());
        for (i, mut batch) in batches.into_iter().enumerate() {
            let tick_id = format!("{}.{}.tick.{i}", self.def.id, self.group);
            let finalize_id = format!("{}.{}.finalize.{i}", self.def.id, self.group);
            let slot: Arc<Mutex<Option<TickBatch>>> = Arc::new(Mutex::new(None));
            let dt = tick.dt;
            let config = self.config.clone();
            {
                let slot = slot.clone();
                builder.add_task(tick_id.clone(), Affinity::Worker, vec![], move || {
                    tick_batch(&mut batch.instances, dt, &config);
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(batch);
                });
            }
            {
                let done = done.clone();
                builder.add_task(
                    finalize_id.clone(),
                    Affinity::Main,
                    vec![tick_id.into()],
                    move || {
                        let batch = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                        if let Some(batch) = batch {
                            done.lock().unwrap_or_else(PoisonError::into_inner).push(batch);
                        }
                    },
                );
            }
            finalize_ids.push(finalize_id.into());
        }
        {
            let completion = completion.clone();
            let join_id = format!("{}.{}.join", self.def.id, self.group);
            builder.add_task(join_id, Affinity::Main, finalize_ids, move || {
                completion.signal();
            });
        }
        let graph = builder.build()?;
        executor.dispatch(graph);
        self.inflight = Some(InflightTick { done, completion });
        trace!("tick dispatched async");
        Ok(())
    }

    /// Barrier: block until this simulation's in-flight tick (if any) has
    /// finished, reintegrate the batches its finalize tasks handed back, and
    /// finalize the frame. Main thread work queued by the executor runs
    /// while waiting.
    pub fn wait_for_tick_complete(&mut self, executor: &FrameExecutor) {
        let Some(inflight) = self.inflight.take() else {
            return;
        };
        executor.wait_for(&inflight.completion);
        let batches = std::mem::take(
            &mut *inflight.done.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for batch in batches {
            self.reintegrate(batch);
        }
        self.finalize_frame();
    }

    /// Check the active-position == row-index invariant. Test hook.
    #[cfg(test)]
    fn assert_container_invariants(&self) {
        assert_eq!(self.active.len(), self.dataset.num_rows());
        assert_eq!(self.paused.len(), self.paused_rows.num_rows());
        for (pos, handle) in self.active.iter().enumerate() {
            assert_eq!(
                self.slots[handle.index as usize].membership,
                Membership::Active(pos)
            );
        }
        for (pos, handle) in self.paused.iter().enumerate() {
            assert_eq!(
                self.slots[handle.index as usize].membership,
                Membership::Paused(pos)
            );
        }
    }
}
