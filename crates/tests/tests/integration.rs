//! End-to-end tests for the emberfall pipeline:
//! Register system → Spawn instances → Run frames → Verify particle state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use emberfall_runtime::data_set::{ColumnDesc, DataSetLayout};
use emberfall_runtime::emitter::{
    BoundsMode, EmitterSpec, EventHandlerSpec, EventMode, SpawnRateEntry,
};
use emberfall_runtime::instance::SystemDef;
use emberfall_runtime::param_store::ParameterLayout;
use emberfall_runtime::script::{CompiledScript, ScriptRole, VmArgs};
use emberfall_runtime::{ExecutionState, InstanceState, SchedulingGroup, SimConfig};
use emberfall_tests::{FnVm, TestHarness, fountain_def, fountain_def_with_system_update, noop_system_script};

/// A constant-rate fountain with a finite particle lifetime settles at a
/// fixed population: every frame one particle spawns and the oldest expires.
#[test]
fn test_fountain_reaches_steady_state() {
    let mut harness = TestHarness::new();
    harness.register(fountain_def("fx.fountain", 10.0, 0.45));
    let id = harness.spawn("fx.fountain");

    // Population ramps one particle per frame until lifetime kicks in.
    for frame in 1..=5 {
        harness.run_frames(1, 0.1);
        assert_eq!(harness.particle_count(id), frame);
    }

    // From then on spawn and expiry balance out.
    for _ in 0..10 {
        let summary = harness.run_frames(1, 0.1);
        assert_eq!(harness.particle_count(id), 5);
        assert_eq!(summary.total_particles, 5);
        assert_eq!(summary.ticked_instances, 1);
    }
}

/// The async tick path must produce the same particle state as running
/// everything inline on the calling thread.
#[test]
fn test_async_matches_inline_results() {
    let def = || fountain_def("fx.fountain", 10.0, 0.45);

    let mut inline = TestHarness::new();
    inline.register(def());
    let mut threaded = TestHarness::with_config(SimConfig::default());
    threaded.register(def());

    let inline_ids: Vec<_> = (0..4).map(|_| inline.spawn("fx.fountain")).collect();
    let threaded_ids: Vec<_> = (0..4).map(|_| threaded.spawn("fx.fountain")).collect();

    inline.run_frames(10, 0.1);
    threaded.run_frames(10, 0.1);

    for (&a, &b) in inline_ids.iter().zip(&threaded_ids) {
        assert_eq!(inline.particle_count(a), threaded.particle_count(b));

        let pa = inline.scheduler().instance(a).unwrap().emitters()[0].particles();
        let pb = threaded.scheduler().instance(b).unwrap().emitters()[0].particles();
        let py = pa.layout().column_index("Position.Y").unwrap();
        for row in 0..pa.num_rows() {
            assert_eq!(pa.get_f32(py, row), pb.get_f32(py, row));
        }
    }
}

/// Pausing an instance freezes its particles in place; resuming picks the
/// simulation back up without losing any of them.
#[test]
fn test_pause_preserves_particles() {
    let mut harness = TestHarness::new();
    harness.register(fountain_def("fx.fountain", 10.0, 100.0));
    let id = harness.spawn("fx.fountain");

    harness.run_frames(5, 0.1);
    assert_eq!(harness.particle_count(id), 5);
    let ticks_before = harness.scheduler().instance(id).unwrap().tick_count();

    harness.scheduler_mut().pause_instance(id).unwrap();
    harness.run_frames(3, 0.1);
    assert_eq!(harness.particle_count(id), 5);
    assert_eq!(
        harness.scheduler().instance(id).unwrap().tick_count(),
        ticks_before
    );
    assert_eq!(
        harness.scheduler().instance(id).unwrap().state(),
        InstanceState::Paused
    );

    harness.scheduler_mut().resume_instance(id).unwrap();
    harness.run_frames(1, 0.1);
    assert_eq!(harness.particle_count(id), 6);
    assert_eq!(
        harness.scheduler().instance(id).unwrap().tick_count(),
        ticks_before + 1
    );
}

/// Moving an instance to a later scheduling group takes effect within the
/// same frame; moving back to an earlier group lags one frame. Either way
/// the instance ticks exactly once per frame.
#[test]
fn test_group_transfer_timing() {
    let mut harness = TestHarness::new();
    harness.register(fountain_def("fx.fountain", 10.0, 100.0));
    let id = harness.spawn("fx.fountain");

    harness.run_frames(2, 0.1);
    assert_eq!(harness.particle_count(id), 2);

    // Demotion: applied mid-frame, destination group ticks it this frame.
    harness
        .scheduler_mut()
        .request_group(id, SchedulingGroup(2))
        .unwrap();
    let summary = harness.run_frames(1, 0.1);
    assert_eq!(harness.particle_count(id), 3);
    assert_eq!(
        harness.scheduler().instance(id).unwrap().current_group(),
        SchedulingGroup(2)
    );
    assert_eq!(summary.simulations, 2);
    assert_eq!(summary.ticked_instances, 1);

    // Promotion: queued this frame, applied at the next frame boundary.
    harness
        .scheduler_mut()
        .request_group(id, SchedulingGroup(0))
        .unwrap();
    harness.run_frames(1, 0.1);
    assert_eq!(harness.particle_count(id), 4);
    assert_eq!(
        harness.scheduler().instance(id).unwrap().current_group(),
        SchedulingGroup(2)
    );

    harness.run_frames(1, 0.1);
    assert_eq!(harness.particle_count(id), 5);
    assert_eq!(
        harness.scheduler().instance(id).unwrap().current_group(),
        SchedulingGroup(0)
    );
}

/// A system update script that drives an emitter's ExecutionState column to
/// Complete gets the whole instance swept at the end of that frame.
#[test]
fn test_system_script_completes_instance() {
    let frames = Arc::new(AtomicU64::new(0));
    let counter = frames.clone();
    let update = Arc::new(CompiledScript::new(
        "system.update",
        ScriptRole::SystemUpdate,
        ParameterLayout::empty(),
        Arc::new(FnVm(move |args: &mut VmArgs<'_, '_>| {
            let ticks = counter.fetch_add(1, Ordering::Relaxed) + 1;
            if ticks < 3 {
                return true;
            }
            let start = args.slots[0].start_row;
            let rows = args.num_rows;
            let Some(data) = args.slots[0].data.get_mut() else {
                return false;
            };
            let Some(col) = data.layout().column_index("fountain.ExecutionState") else {
                return false;
            };
            for row in start..start + rows {
                data.set_i32(col, row, ExecutionState::Complete.to_i32());
            }
            true
        })),
    ));

    let mut harness = TestHarness::new();
    harness.register(fountain_def_with_system_update("fx.burst", 10.0, 100.0, update));
    let id = harness.spawn("fx.burst");

    harness.run_frames(2, 0.1);
    assert_eq!(harness.particle_count(id), 2);

    let summary = harness.run_frames(1, 0.1);
    assert_eq!(summary.completed_instances, 1);
    assert_eq!(
        harness.scheduler().instance(id).unwrap().state(),
        InstanceState::Disabled
    );
    assert_eq!(harness.particle_count(id), 0);

    // Nothing left to tick; the slot frees once the owner destroys the id.
    let summary = harness.run_frames(1, 0.1);
    assert_eq!(summary.ticked_instances, 0);
    harness.scheduler_mut().destroy_instance(id).unwrap();
    assert!(harness.scheduler().instance(id).is_err());
}

/// Producer/consumer event chain through the public API: the producer emits
/// one event per live particle each frame and the consumer spawns two
/// particles per event in the same frame.
#[test]
fn test_event_handler_chain() {
    let particle_layout = || {
        DataSetLayout::new(vec![
            ColumnDesc::float("Position.X"),
            ColumnDesc::float("Position.Y"),
            ColumnDesc::float("Position.Z"),
            ColumnDesc::float("Age"),
        ])
    };
    let event_layout = DataSetLayout::new(vec![ColumnDesc::float("Magnitude")]);

    let noop_particles = |id: &str, role| {
        Arc::new(CompiledScript::new(
            id,
            role,
            ParameterLayout::empty(),
            Arc::new(FnVm(|_args: &mut VmArgs<'_, '_>| true)),
        ))
    };

    // One event row per existing particle, every frame.
    let emitting_update = Arc::new(CompiledScript::new(
        "producer.update",
        ScriptRole::ParticleUpdate,
        ParameterLayout::new(&[("DeltaTime", 4)]),
        Arc::new(FnVm(|args: &mut VmArgs<'_, '_>| {
            let rows = args.num_rows;
            let Some(events) = args.slots[1].data.get_mut() else {
                return false;
            };
            for _ in 0..rows {
                let row = events.push_row();
                events.set_f32(0, row, 2.5);
            }
            true
        })),
    ));

    // Stamps each handler-spawned particle with the first event's magnitude.
    let handler_script = Arc::new(CompiledScript::new(
        "consumer.handler",
        ScriptRole::Event,
        ParameterLayout::new(&[("SpawnCount", 4)]),
        Arc::new(FnVm(|args: &mut VmArgs<'_, '_>| {
            let magnitude = args.slots[1].data.get().get_f32(0, 0);
            let start = args.slots[0].start_row;
            let rows = args.num_rows;
            let Some(data) = args.slots[0].data.get_mut() else {
                return false;
            };
            for row in start..start + rows {
                data.set_f32(0, row, magnitude);
            }
            true
        })),
    ));

    let producer = EmitterSpec {
        id: "producer".into(),
        particle_layout: particle_layout(),
        spawn_script: noop_particles("producer.spawn", ScriptRole::ParticleSpawn),
        update_script: emitting_update,
        gpu_script: None,
        event_layouts: vec![event_layout],
        event_handlers: vec![],
        spawn_rate: vec![SpawnRateEntry { rate: 10.0 }],
        spawn_ceiling: None,
        bounds_mode: BoundsMode::Dynamic,
        interfaces: vec![],
        estimated_particles: 64,
    };
    let consumer = EmitterSpec {
        id: "consumer".into(),
        particle_layout: particle_layout(),
        spawn_script: noop_particles("consumer.spawn", ScriptRole::ParticleSpawn),
        update_script: noop_particles("consumer.update", ScriptRole::ParticleUpdate),
        gpu_script: None,
        event_layouts: vec![],
        event_handlers: vec![EventHandlerSpec {
            source_emitter: 0,
            source_event: 0,
            spawn_per_event: 2,
            mode: EventMode::Batch,
            script: handler_script,
        }],
        spawn_rate: vec![],
        spawn_ceiling: None,
        bounds_mode: BoundsMode::Dynamic,
        interfaces: vec![],
        estimated_particles: 64,
    };
    let def = SystemDef {
        id: "fx.chain".into(),
        emitters: vec![Arc::new(producer), Arc::new(consumer)],
        spawn_script: noop_system_script("system.spawn", ScriptRole::SystemSpawn),
        update_script: noop_system_script("system.update", ScriptRole::SystemUpdate),
        parameters: ParameterLayout::new(&[("Intensity", 4)]),
        initial_group: SchedulingGroup(0),
    };

    let mut harness = TestHarness::new();
    harness.register(def);
    let id = harness.spawn("fx.chain");

    // Frame n: producer has n-1 existing particles, so the consumer spawns
    // 2*(n-1). After 5 frames: producer 5, consumer 2*(0+1+2+3+4) = 20.
    harness.run_frames(5, 0.1);
    let instance = harness.scheduler().instance(id).unwrap();
    let producer = &instance.emitters()[0];
    let consumer = &instance.emitters()[1];
    assert_eq!(producer.num_particles(), 5);
    assert_eq!(consumer.num_particles(), 20);

    // Handler-spawned particles carry the event payload.
    let particles = consumer.particles();
    for row in 0..particles.num_rows() {
        assert_eq!(particles.get_f32(0, row), 2.5);
    }
}

/// Several systems registered at once all advance within a single frame and
/// the summary aggregates across their simulations.
#[test]
fn test_multiple_systems_share_a_frame() {
    let mut harness = TestHarness::new();
    harness.register(fountain_def("fx.a", 10.0, 100.0));
    harness.register(fountain_def("fx.b", 20.0, 100.0));
    let a = harness.spawn("fx.a");
    let b = harness.spawn("fx.b");

    let summary = harness.run_frames(3, 0.1);
    assert_eq!(summary.simulations, 2);
    assert_eq!(summary.ticked_instances, 2);
    assert_eq!(harness.particle_count(a), 3);
    assert_eq!(harness.particle_count(b), 6);
    assert_eq!(summary.total_particles, 9);
}
