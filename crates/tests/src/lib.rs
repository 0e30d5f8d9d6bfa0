//! Integration test harness for emberfall.
//!
//! This crate provides utilities for end-to-end testing of the full
//! simulation pipeline: Register → Spawn → Run frames → Verify.

use std::sync::Arc;

use emberfall_runtime::data_set::{ColumnDesc, DataSetLayout};
use emberfall_runtime::emitter::{BoundsMode, EmitterSpec, SpawnRateEntry};
use emberfall_runtime::instance::SystemDef;
use emberfall_runtime::param_store::ParameterLayout;
use emberfall_runtime::sched::{FrameScheduler, FrameSummary};
use emberfall_runtime::script::{CompiledScript, ScriptRole, ScriptVm, VmArgs};
use emberfall_runtime::{Dt, InstanceId, SchedulingGroup, SimConfig, SystemId};

/// Closure-backed script VM for building test systems inline.
pub struct FnVm<F>(pub F);

impl<F> ScriptVm for FnVm<F>
where
    F: Fn(&mut VmArgs<'_, '_>) -> bool + Send + Sync,
{
    fn execute(&self, args: &mut VmArgs<'_, '_>) -> bool {
        (self.0)(args)
    }
}

fn fountain_layout() -> DataSetLayout {
    DataSetLayout::new(vec![
        ColumnDesc::float("Position.X"),
        ColumnDesc::float("Position.Y"),
        ColumnDesc::float("Position.Z"),
        ColumnDesc::float("Velocity.Y"),
        ColumnDesc::float("Age"),
    ])
}

fn fountain_spawn() -> Arc<CompiledScript> {
    Arc::new(CompiledScript::new(
        "fountain.spawn",
        ScriptRole::ParticleSpawn,
        ParameterLayout::new(&[("SpawnCount", 4)]),
        Arc::new(FnVm(|args: &mut VmArgs<'_, '_>| {
            let start = args.slots[0].start_row;
            let rows = args.num_rows;
            let Some(data) = args.slots[0].data.get_mut() else {
                return false;
            };
            let Some(velocity) = data.layout().column_index("Velocity.Y") else {
                return false;
            };
            for row in start..start + rows {
                data.set_f32(velocity, row, 1.0);
            }
            true
        })),
    ))
}

/// Ages particles, integrates vertical motion, and compacts away particles
/// older than `lifetime`.
fn fountain_update(lifetime: f32) -> Arc<CompiledScript> {
    Arc::new(CompiledScript::new(
        "fountain.update",
        ScriptRole::ParticleUpdate,
        ParameterLayout::new(&[("DeltaTime", 4)]),
        Arc::new(FnVm(move |args: &mut VmArgs<'_, '_>| {
            let start = args.slots[0].start_row;
            let rows = args.num_rows;
            let dt = args.dt;
            let Some(data) = args.slots[0].data.get_mut() else {
                return false;
            };
            let age_col = data.layout().column_index("Age").unwrap();
            let py_col = data.layout().column_index("Position.Y").unwrap();
            let vy_col = data.layout().column_index("Velocity.Y").unwrap();
            let columns = data.layout().len();

            let mut keep = start;
            for row in start..start + rows {
                let age = data.get_f32(age_col, row) + dt;
                if age > lifetime {
                    continue;
                }
                if keep != row {
                    for col in 0..columns {
                        let cell = data.cell(col, row);
                        data.set_cell(col, keep, cell);
                    }
                }
                data.set_f32(age_col, keep, age);
                let y = data.get_f32(py_col, keep) + data.get_f32(vy_col, keep) * dt;
                data.set_f32(py_col, keep, y);
                keep += 1;
            }
            data.truncate(keep);
            true
        })),
    ))
}

/// System-level script that leaves the system row untouched.
pub fn noop_system_script(id: &str, role: ScriptRole) -> Arc<CompiledScript> {
    Arc::new(CompiledScript::new(
        id,
        role,
        ParameterLayout::empty(),
        Arc::new(FnVm(|_args: &mut VmArgs<'_, '_>| true)),
    ))
}

/// One-emitter fountain: `rate` particles per second, each living `lifetime`
/// seconds. The emitter is named `fountain`, so the system DataSet carries
/// `fountain.ExecutionState` and `fountain.SpawnCount` columns.
pub fn fountain_def(system: &str, rate: f32, lifetime: f32) -> SystemDef {
    let emitter = EmitterSpec {
        id: "fountain".into(),
        particle_layout: fountain_layout(),
        spawn_script: fountain_spawn(),
        update_script: fountain_update(lifetime),
        gpu_script: None,
        event_layouts: vec![],
        event_handlers: vec![],
        spawn_rate: vec![SpawnRateEntry { rate }],
        spawn_ceiling: None,
        bounds_mode: BoundsMode::Dynamic,
        interfaces: vec![],
        estimated_particles: 64,
    };
    SystemDef {
        id: system.into(),
        emitters: vec![Arc::new(emitter)],
        spawn_script: noop_system_script("system.spawn", ScriptRole::SystemSpawn),
        update_script: noop_system_script("system.update", ScriptRole::SystemUpdate),
        parameters: ParameterLayout::new(&[("Intensity", 4)]),
        initial_group: SchedulingGroup(0),
    }
}

/// Same fountain with a caller-supplied system update script, for driving the
/// per-emitter back-projection columns from a test.
pub fn fountain_def_with_system_update(
    system: &str,
    rate: f32,
    lifetime: f32,
    update: Arc<CompiledScript>,
) -> SystemDef {
    let mut def = fountain_def(system, rate, lifetime);
    def.update_script = update;
    def
}

/// Test harness wrapping a [`FrameScheduler`].
///
/// # Panics
///
/// Methods panic on scheduler errors; in a test a failure is a failure.
pub struct TestHarness {
    sched: FrameScheduler,
}

impl TestHarness {
    /// Harness that runs every frame inline on the calling thread.
    pub fn new() -> Self {
        Self::with_config(SimConfig {
            allow_async: false,
            ..SimConfig::default()
        })
    }

    pub fn with_config(config: SimConfig) -> Self {
        Self {
            sched: FrameScheduler::new(config),
        }
    }

    pub fn register(&mut self, def: SystemDef) {
        self.sched.register_system(Arc::new(def));
    }

    pub fn spawn(&mut self, system: &str) -> InstanceId {
        self.sched
            .spawn_instance(&SystemId::from(system))
            .expect("spawn failed")
    }

    /// Run `frames` frames, returning the last frame's summary. All in-flight
    /// ticks are complete on return.
    pub fn run_frames(&mut self, frames: usize, dt: f32) -> FrameSummary {
        let mut last = FrameSummary::default();
        for _ in 0..frames {
            last = self.sched.run_frame(Dt(dt)).expect("frame failed");
        }
        self.sched.wait_all();
        last
    }

    /// Total live particles across all emitters of one instance.
    pub fn particle_count(&self, id: InstanceId) -> usize {
        self.sched
            .instance(id)
            .expect("unknown instance")
            .emitters()
            .iter()
            .map(|e| e.num_particles())
            .sum()
    }

    pub fn scheduler(&self) -> &FrameScheduler {
        &self.sched
    }

    pub fn scheduler_mut(&mut self) -> &mut FrameScheduler {
        &mut self.sched
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
