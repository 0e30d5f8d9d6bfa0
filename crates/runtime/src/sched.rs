//! Frame scheduler
//!
//! The [`FrameScheduler`] owns every [`SystemSimulation`] and runs one frame
//! at a time: wait for the previous frame's in-flight ticks, apply queued
//! group promotions, then process scheduling groups in ascending order. For
//! each group: spawn phase, update phase, transfer processing, dispatch.
//!
//! Transfer rules: a demotion (to a later group, which has not run yet this
//! frame) moves immediately, after the source's update phase and before its
//! dispatch, so the instance ticks exactly once, in the destination, and
//! participates in the destination's update phase this same frame. A
//! promotion (to an earlier group, already run) is queued and applied at the
//! start of the next frame.

use std::sync::Arc;

use emberfall_taskgraph::FrameExecutor;
use indexmap::IndexMap;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::instance::{SystemDef, SystemInstance};
use crate::pool::{CullState, InstancePool, ScalabilityPolicy};
use crate::simulation::SystemSimulation;
use crate::types::{
    Dt, InstanceHandle, InstanceId, InstanceState, SchedulingGroup, SimConfig, SystemId, TickInfo,
};

/// Retired instances kept around per system for reuse
const POOL_CAPACITY_PER_SYSTEM: usize = 32;

/// Where an instance currently lives
#[derive(Debug, Clone)]
struct InstanceLocation {
    system: SystemId,
    group: SchedulingGroup,
    handle: InstanceHandle,
}

/// Aggregate counters for one completed `run_frame`
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameSummary {
    pub frame: u64,
    pub simulations: usize,
    pub spawned_instances: usize,
    pub ticked_instances: usize,
    pub completed_instances: usize,
    pub total_particles: usize,
    /// Spawn requests discarded by per-emitter ceilings this frame
    pub overflow_dropped: u64,
}

/// Owns all simulations and drives them one frame at a time.
pub struct FrameScheduler {
    config: SimConfig,
    executor: FrameExecutor,
    defs: IndexMap<SystemId, Arc<SystemDef>>,
    /// Sorted ascending by (group, system id)
    sims: Vec<SystemSimulation>,
    registry: IndexMap<InstanceId, InstanceLocation>,
    queued_promotions: Vec<(InstanceId, SchedulingGroup)>,
    pool: InstancePool,
    next_instance: u64,
    frame: u64,
}

impl FrameScheduler {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            executor: FrameExecutor::new(),
            defs: IndexMap::new(),
            sims: Vec::new(),
            registry: IndexMap::new(),
            queued_promotions: Vec::new(),
            pool: InstancePool::new(POOL_CAPACITY_PER_SYSTEM),
            next_instance: 0,
            frame: 0,
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn register_system(&mut self, def: Arc<SystemDef>) {
        debug!(system = %def.id, "system registered");
        self.defs.insert(def.id.clone(), def);
    }

    fn sim_index(&self, system: &SystemId, group: SchedulingGroup) -> Option<usize> {
        self.sims
            .iter()
            .position(|s| s.group() == group && &s.def().id == system)
    }

    fn find_or_create_sim(&mut self, system: &SystemId, group: SchedulingGroup) -> Result<usize> {
        if let Some(idx) = self.sim_index(system, group) {
            return Ok(idx);
        }
        let def = self
            .defs
            .get(system)
            .cloned()
            .ok_or_else(|| Error::UnknownSystem(system.clone()))?;
        let sim = SystemSimulation::new(def, group, self.config.clone())?;
        let at = self
            .sims
            .partition_point(|s| (s.group(), &s.def().id) < (group, system));
        self.sims.insert(at, sim);
        Ok(at)
    }

    /// Create one instance of a registered system in its initial group. It
    /// starts simulating on the next frame.
    pub fn spawn_instance(&mut self, system: &SystemId) -> Result<InstanceId> {
        let def = self
            .defs
            .get(system)
            .cloned()
            .ok_or_else(|| Error::UnknownSystem(system.clone()))?;
        let group = def.initial_group;
        let idx = self.find_or_create_sim(system, group)?;
        let id = InstanceId(self.next_instance);
        self.next_instance += 1;
        let instance = self.pool.acquire(&def, id);
        let handle = self.sims[idx].insert_pending(instance);
        self.registry.insert(
            id,
            InstanceLocation {
                system: system.clone(),
                group,
                handle,
            },
        );
        Ok(id)
    }

    fn locate(&self, id: InstanceId) -> Result<&InstanceLocation> {
        self.registry.get(&id).ok_or(Error::UnknownInstance(id))
    }

    fn sim_for(&self, loc: &InstanceLocation) -> Result<usize> {
        self.sim_index(&loc.system, loc.group)
            .ok_or(Error::UnknownGroup(loc.group))
    }

    pub fn instance(&self, id: InstanceId) -> Result<&SystemInstance> {
        let loc = self.locate(id)?;
        let idx = self.sim_for(loc)?;
        self.sims[idx].instance(loc.handle)
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> Result<&mut SystemInstance> {
        let loc = self.locate(id)?.clone();
        let idx = self.sim_for(&loc)?;
        self.sims[idx].instance_mut(loc.handle)
    }

    pub fn destroy_instance(&mut self, id: InstanceId) -> Result<()> {
        let loc = self.locate(id)?.clone();
        let idx = self.sim_for(&loc)?;
        self.sims[idx].wait_for_tick_complete(&self.executor);
        let instance = self.sims[idx].take_instance(loc.handle)?;
        self.pool.release(&loc.system, instance);
        self.registry.swap_remove(&id);
        self.queued_promotions.retain(|(queued, _)| *queued != id);
        Ok(())
    }

    pub fn pause_instance(&mut self, id: InstanceId) -> Result<()> {
        let loc = self.locate(id)?.clone();
        let idx = self.sim_for(&loc)?;
        self.sims[idx].wait_for_tick_complete(&self.executor);
        self.sims[idx].pause_instance(loc.handle)
    }

    pub fn resume_instance(&mut self, id: InstanceId) -> Result<()> {
        let loc = self.locate(id)?.clone();
        let idx = self.sim_for(&loc)?;
        self.sims[idx].wait_for_tick_complete(&self.executor);
        self.sims[idx].resume_instance(loc.handle)
    }

    /// Ask for the instance to simulate in another group. Demotions apply
    /// within the next frame; promotions one frame later.
    pub fn request_group(&mut self, id: InstanceId, group: SchedulingGroup) -> Result<()> {
        self.instance_mut(id)?.request_group(group);
        Ok(())
    }

    /// Move an instance to `group` right now. Both simulations must be idle.
    fn transfer_now(&mut self, id: InstanceId, group: SchedulingGroup) -> Result<()> {
        let loc = self.locate(id)?.clone();
        if loc.group == group {
            return Ok(());
        }
        let dest = self.find_or_create_sim(&loc.system, group)?;
        // look the source up after creation, which may shift indices
        let src = self
            .sim_index(&loc.system, loc.group)
            .ok_or(Error::UnknownGroup(loc.group))?;
        debug_assert_ne!(src, dest);
        let new_handle = {
            let (first, second) = if src < dest {
                let (l, r) = self.sims.split_at_mut(dest);
                (&mut l[src], &mut r[0])
            } else {
                let (l, r) = self.sims.split_at_mut(src);
                (&mut r[0], &mut l[dest])
            };
            first.transfer_to(loc.handle, second)?
        };
        self.registry.insert(
            id,
            InstanceLocation {
                system: loc.system,
                group,
                handle: new_handle,
            },
        );
        debug!(instance = %id, from = %loc.group, to = %group, "instance transferred");
        Ok(())
    }

    /// Collect this simulation's transfer requests: demotions move now,
    /// promotions are queued for the next frame boundary.
    fn process_transfers_from(&mut self, sim_idx: usize) -> Result<()> {
        let group = self.sims[sim_idx].group();
        let requests = self.sims[sim_idx].transfer_requests();
        for (handle, requested) in requests {
            let id = self.sims[sim_idx].instance(handle)?.id();
            if requested > group {
                self.transfer_now(id, requested)?;
            } else {
                self.queued_promotions.push((id, requested));
            }
        }
        Ok(())
    }

    /// Advance every simulation one frame. Groups still overlap within the
    /// frame (a later group's game-thread phases run while an earlier
    /// group's ticks are in flight), but the returned summary reflects a
    /// fully settled frame, so the last group's ticks are waited on before
    /// counters are read.
    #[instrument(skip_all, fields(frame = self.frame + 1))]
    pub fn run_frame(&mut self, dt: Dt) -> Result<FrameSummary> {
        self.frame += 1;

        // Barrier: nothing from the previous frame may still be in flight.
        for sim in &mut self.sims {
            sim.wait_for_tick_complete(&self.executor);
        }

        // Promotions queued last frame apply at the frame boundary, so the
        // instance ticks in its new (earlier) group from this frame on.
        let promotions = std::mem::take(&mut self.queued_promotions);
        for (id, group) in promotions {
            if let Err(e) = self.transfer_now(id, group) {
                warn!(instance = %id, error = %e, "queued promotion dropped");
            }
        }

        // Groups in ascending order. Simulations created mid-frame by a
        // demotion land at a later index and are picked up by this same loop.
        let mut idx = 0;
        while idx < self.sims.len() {
            let tick = TickInfo {
                frame: self.frame,
                dt,
                group: self.sims[idx].group(),
            };
            self.sims[idx].spawn_phase(&tick);
            self.sims[idx].update_phase(&tick);
            self.process_transfers_from(idx)?;
            self.sims[idx].dispatch_tick(&tick, Some(&self.executor))?;
            idx += 1;
        }

        // Counters settle at reintegration, so in-flight ticks must land
        // before the summary is read.
        for sim in &mut self.sims {
            sim.wait_for_tick_complete(&self.executor);
        }

        let mut summary = FrameSummary {
            frame: self.frame,
            simulations: self.sims.len(),
            ..FrameSummary::default()
        };
        for sim in &self.sims {
            let stats = sim.stats();
            summary.spawned_instances += stats.spawned_instances;
            summary.ticked_instances += stats.ticked_instances;
            summary.completed_instances += stats.completed_instances;
            summary.total_particles += stats.total_particles;
            summary.overflow_dropped += stats.overflow_dropped;
        }
        Ok(summary)
    }

    /// Block until every in-flight tick has completed and been reintegrated.
    pub fn wait_all(&mut self) {
        for sim in &mut self.sims {
            sim.wait_for_tick_complete(&self.executor);
        }
    }

    /// Pause instances the policy culls and resume previously culled ones
    /// that are visible again. `distances` is viewer distance per instance;
    /// instances not listed are left alone.
    pub fn apply_scalability(
        &mut self,
        policy: &ScalabilityPolicy,
        distances: &[(InstanceId, f32)],
    ) -> Result<()> {
        let mut ranked = distances.to_vec();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        for (rank, (id, distance)) in ranked.iter().enumerate() {
            let state = self.instance(*id)?.state();
            match policy.evaluate(*distance, rank) {
                CullState::Culled if state == InstanceState::Active => {
                    self.pause_instance(*id)?;
                }
                CullState::Visible if state == InstanceState::Paused => {
                    self.resume_instance(*id)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}
