//! Instance pooling and scalability culling
//!
//! Building a [`SystemInstance`](crate::instance::SystemInstance) allocates
//! storage for every emitter, so short-lived effects churn. The pool keeps a
//! bounded number of retired instances per system and hands them back reset.
//! [`ScalabilityPolicy`] decides which instances are worth simulating at all;
//! culled instances are paused, not destroyed, so they rejoin cheaply.

use indexmap::IndexMap;
use tracing::trace;

use crate::instance::{SystemDef, SystemInstance};
use crate::types::{InstanceId, SystemId};

/// Whether an instance should simulate this frame under the current policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullState {
    Visible,
    Culled,
}

/// Distance and count limits for instance culling.
///
/// `rank` is the instance's position among all candidates ordered nearest
/// first, so the count limit keeps the closest ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalabilityPolicy {
    pub max_distance: Option<f32>,
    pub max_instances: Option<usize>,
}

impl ScalabilityPolicy {
    pub fn evaluate(&self, distance: f32, rank: usize) -> CullState {
        if let Some(max) = self.max_distance {
            if distance > max {
                return CullState::Culled;
            }
        }
        if let Some(max) = self.max_instances {
            if rank >= max {
                return CullState::Culled;
            }
        }
        CullState::Visible
    }
}

/// Bounded per-system free list of retired instances.
#[derive(Default)]
pub struct InstancePool {
    capacity_per_system: usize,
    pools: IndexMap<SystemId, Vec<SystemInstance>>,
}

impl InstancePool {
    pub fn new(capacity_per_system: usize) -> Self {
        Self {
            capacity_per_system,
            pools: IndexMap::new(),
        }
    }

    pub fn pooled(&self, system: &SystemId) -> usize {
        self.pools.get(system).map_or(0, Vec::len)
    }

    /// Take a reset instance for `def`, building a fresh one on a miss.
    pub fn acquire(&mut self, def: &SystemDef, id: InstanceId) -> SystemInstance {
        if let Some(mut instance) = self.pools.get_mut(&def.id).and_then(Vec::pop) {
            trace!(system = %def.id, instance = %id, "pool hit");
            instance.reassign(id);
            return instance;
        }
        SystemInstance::new(id, def)
    }

    /// Retire an instance. Instances with a permanently disabled emitter are
    /// dropped; they could never simulate again.
    pub fn release(&mut self, system: &SystemId, instance: SystemInstance) {
        if !instance.is_poolable() {
            return;
        }
        let pool = self.pools.entry(system.clone()).or_default();
        if pool.len() < self.capacity_per_system {
            pool.push(instance);
        }
    }
}
