//! Script execution
//!
//! The bytecode interpreter is an external collaborator: [`ScriptVm`] is an
//! opaque `execute` whose declared side effect is in-place mutation of bound
//! DataSet slots, returning false on failure with no partial-success signal.
//! [`ScriptExecutionContext`] binds one compiled script to its input/output
//! DataSets and constant buffers and owns the lazy function-table and
//! constant-buffer rebuilds.

use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::data_set::{ColumnType, DataSet};
use crate::error::{Error, Result};
use crate::param_store::{ParameterLayout, ParameterStore};
use crate::types::ScriptId;

/// Role a script plays within an emitter or system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptRole {
    ParticleSpawn,
    ParticleUpdate,
    Event,
    SystemSpawn,
    SystemUpdate,
    GpuCompute,
}

impl ScriptRole {
    /// Update scripts never increase row count; spawn scripts only append.
    fn is_update(&self) -> bool {
        matches!(self, ScriptRole::ParticleUpdate | ScriptRole::SystemUpdate)
    }
}

/// One script-visible attribute (variable)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptAttribute {
    pub name: String,
    pub ty: ColumnType,
}

/// A data interface a script binds at runtime.
///
/// The runtime only queries shape and readiness; a shape change forces the
/// owning context to regenerate its function table on the next tick.
pub trait DataInterface: Send + Sync {
    fn name(&self) -> &str;
    /// Changes whenever the backing data's shape changes
    fn shape_id(&self) -> u64;
    /// Re-resolve the interface's function table entries; false is a
    /// non-retryable bind failure for the current frame.
    fn bind(&self) -> bool;
}

/// Compiled script asset surface. This core only queries shape and
/// readiness; compilation happens elsewhere.
pub struct CompiledScript {
    pub id: ScriptId,
    pub role: ScriptRole,
    pub attributes: Vec<ScriptAttribute>,
    pub data_interfaces: Vec<String>,
    pub params: ParameterLayout,
    vm: Arc<dyn ScriptVm>,
    ready: bool,
}

impl CompiledScript {
    pub fn new(
        id: impl Into<ScriptId>,
        role: ScriptRole,
        params: ParameterLayout,
        vm: Arc<dyn ScriptVm>,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            attributes: Vec::new(),
            data_interfaces: Vec::new(),
            params,
            vm,
            ready: true,
        }
    }

    pub fn with_attributes(mut self, attributes: Vec<ScriptAttribute>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_data_interfaces(mut self, interfaces: Vec<String>) -> Self {
        self.data_interfaces = interfaces;
        self
    }

    pub fn with_readiness(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    /// Readiness predicate of the compiled asset
    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

impl std::fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledScript")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("ready", &self.ready)
            .finish()
    }
}

/// Access to one bound slot during execution. Slot 0 is "self"; the rest are
/// satellite/event sets, which may be read-only.
pub enum SlotData<'a> {
    Mut(&'a mut DataSet),
    Shared(&'a DataSet),
}

impl<'a> SlotData<'a> {
    pub fn get(&self) -> &DataSet {
        match self {
            SlotData::Mut(d) => d,
            SlotData::Shared(d) => d,
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut DataSet> {
        match self {
            SlotData::Mut(d) => Some(d),
            SlotData::Shared(_) => None,
        }
    }
}

/// A bound slot plus the starting row of this execution
pub struct VmSlot<'a> {
    pub data: SlotData<'a>,
    pub start_row: usize,
}

/// Table of constant buffers visible to one execution. By convention buffer
/// 0 is the context's parameters and buffer 1 the previous-frame copy;
/// callers may append externals.
pub struct ConstantTable<'a> {
    pub buffers: Vec<&'a [u8]>,
}

impl<'a> ConstantTable<'a> {
    pub fn f32_at(&self, buffer: usize, offset: usize) -> f32 {
        f32::from_le_bytes(self.buffers[buffer][offset..offset + 4].try_into().unwrap())
    }

    pub fn i32_at(&self, buffer: usize, offset: usize) -> i32 {
        i32::from_le_bytes(self.buffers[buffer][offset..offset + 4].try_into().unwrap())
    }
}

/// Everything a VM invocation sees
pub struct VmArgs<'a, 'b> {
    pub slots: &'b mut [VmSlot<'a>],
    pub num_rows: usize,
    pub dt: f32,
    pub constants: &'b ConstantTable<'a>,
}

/// Opaque script interpreter.
pub trait ScriptVm: Send + Sync {
    /// Mutates bound slots in place over `[start_row, start_row + num_rows)`.
    /// Returns false on failure, with no partial-success signal.
    fn execute(&self, args: &mut VmArgs<'_, '_>) -> bool;
}

/// Execution context state machine:
/// Uninitialized → `init` → {Ready | Failed}; a tick-time bind failure also
/// enters Failed, which is non-retryable for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Ready,
    Failed,
}

/// Per-slot binding recorded by `bind_data`
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotBinding {
    pub start_row: usize,
    pub keep_existing: bool,
}

/// Binds one compiled script to DataSets and constant buffers and executes
/// it over row ranges.
pub struct ScriptExecutionContext {
    script: Option<Arc<CompiledScript>>,
    state: ContextState,
    parameters: ParameterStore,
    previous_parameters: Vec<u8>,
    bindings: Vec<SlotBinding>,
    interfaces: Vec<Arc<dyn DataInterface>>,
    interface_shapes: Vec<u64>,
    cbuffer_size: usize,
    function_table_version: u64,
    post_ticked: bool,
}

impl Default for ScriptExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptExecutionContext {
    pub fn new() -> Self {
        Self {
            script: None,
            state: ContextState::Uninitialized,
            parameters: ParameterStore::new(ParameterLayout::empty()),
            previous_parameters: Vec::new(),
            bindings: Vec::new(),
            interfaces: Vec::new(),
            interface_shapes: Vec::new(),
            cbuffer_size: 0,
            function_table_version: 0,
            post_ticked: false,
        }
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn script(&self) -> Option<&Arc<CompiledScript>> {
        self.script.as_ref()
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.parameters
    }

    /// Bumped whenever the function table is regenerated
    pub fn function_table_version(&self) -> u64 {
        self.function_table_version
    }

    /// Bind the compiled script and its data interfaces. Failure is
    /// fatal-for-instance: the caller must mark the owner Disabled.
    pub fn init(
        &mut self,
        script: Arc<CompiledScript>,
        interfaces: Vec<Arc<dyn DataInterface>>,
    ) -> Result<()> {
        if !script.is_ready() {
            self.state = ContextState::Failed;
            return Err(Error::ScriptNotReady(script.id.clone()));
        }
        for required in &script.data_interfaces {
            let found = interfaces.iter().find(|i| i.name() == required);
            let Some(interface) = found else {
                self.state = ContextState::Failed;
                return Err(Error::BindFailure {
                    script: script.id.clone(),
                    interface: required.clone(),
                });
            };
            if !interface.bind() {
                self.state = ContextState::Failed;
                return Err(Error::BindFailure {
                    script: script.id.clone(),
                    interface: required.clone(),
                });
            }
        }
        self.parameters = ParameterStore::new(script.params.clone());
        self.cbuffer_size = script.params.size();
        self.previous_parameters = vec![0; self.cbuffer_size];
        self.interface_shapes = interfaces.iter().map(|i| i.shape_id()).collect();
        self.interfaces = interfaces;
        self.function_table_version = 1;
        self.script = Some(script);
        self.state = ContextState::Ready;
        debug!(script = %self.script.as_ref().unwrap().id, "execution context ready");
        Ok(())
    }

    /// Per-frame maintenance: regenerate the function table if any bound
    /// data interface reports a shape change, rebuild the constant-buffer
    /// layout if the parameter byte-size changed. Returns false (entering
    /// Failed) on bind failure — non-retryable for the current frame.
    pub fn tick(&mut self) -> bool {
        assert!(
            self.state != ContextState::Uninitialized,
            "tick before init"
        );
        if self.state == ContextState::Failed {
            return false;
        }

        for (i, interface) in self.interfaces.iter().enumerate() {
            let shape = interface.shape_id();
            if shape != self.interface_shapes[i] {
                trace!(interface = interface.name(), "shape change, regenerating function table");
                self.interface_shapes[i] = shape;
                self.function_table_version += 1;
                if !interface.bind() {
                    error!(
                        script = %self.script.as_ref().unwrap().id,
                        interface = interface.name(),
                        "data interface bind failure"
                    );
                    self.state = ContextState::Failed;
                    return false;
                }
            }
        }

        let param_size = self.parameters.layout().size();
        if param_size != self.cbuffer_size {
            trace!(old = self.cbuffer_size, new = param_size, "constant buffer relayout");
            self.cbuffer_size = param_size;
            self.previous_parameters.resize(param_size, 0);
        }

        self.post_ticked = false;
        true
    }

    /// Associate a starting row with one of the script's addressable slots.
    /// Slot 0 is "self"; others are satellite/event sets.
    pub fn bind_data(&mut self, slot: usize, start_row: usize, keep_existing: bool) {
        if self.bindings.len() <= slot {
            self.bindings.resize(slot + 1, SlotBinding::default());
        }
        self.bindings[slot] = SlotBinding {
            start_row,
            keep_existing,
        };
    }

    /// Run the script over `[start_row, start_row + num_rows)` for every
    /// bound slot. `slots` must match the slots bound via `bind_data`, in
    /// order. Update scripts that grow their self slot are clamped back.
    pub fn execute(
        &mut self,
        slots: Vec<SlotData<'_>>,
        num_rows: usize,
        dt: f32,
        externals: &[&[u8]],
    ) -> Result<()> {
        let script = match (&self.state, &self.script) {
            (ContextState::Ready, Some(script)) => script.clone(),
            (_, Some(script)) => return Err(Error::ContextNotReady(script.id.clone())),
            _ => panic!("execute before init"),
        };
        assert_eq!(
            slots.len(),
            self.bindings.len(),
            "slot count does not match bindings"
        );

        let mut vm_slots: Vec<VmSlot<'_>> = slots
            .into_iter()
            .zip(self.bindings.iter())
            .map(|(data, binding)| VmSlot {
                data,
                start_row: binding.start_row,
            })
            .collect();

        let rows_before = vm_slots[0].data.get().active_rows();

        let mut buffers: Vec<&[u8]> = Vec::with_capacity(2 + externals.len());
        buffers.push(self.parameters.bytes());
        buffers.push(&self.previous_parameters);
        buffers.extend_from_slice(externals);
        let constants = ConstantTable { buffers };

        let mut args = VmArgs {
            slots: &mut vm_slots,
            num_rows,
            dt,
            constants: &constants,
        };

        trace!(script = %script.id, num_rows, "execute");
        let ok = script.vm.execute(&mut args);
        if !ok {
            return Err(Error::ExecutionFailed(script.id.clone()));
        }

        if script.role.is_update() {
            if let Some(data) = vm_slots[0].data.get_mut() {
                let rows_after = data.active_rows();
                if rows_after > rows_before {
                    warn!(
                        script = %script.id,
                        rows_before,
                        rows_after,
                        "update script grew row count, clamping"
                    );
                    data.truncate(rows_before);
                }
            }
        }
        Ok(())
    }

    /// Copy current constant values into the "previous" slots for scripts
    /// needing temporal interpolation. Runs exactly once per tick, after all
    /// Execute calls for the phase; extra calls in the same tick are no-ops.
    pub fn post_tick(&mut self) {
        if self.post_ticked {
            return;
        }
        self.prime_previous();
        self.post_ticked = true;
    }

    /// Seed the previous-value buffer from current values without consuming
    /// the per-tick PostTick budget. Owners call this on their first tick so
    /// interpolating scripts see sane history.
    pub fn prime_previous(&mut self) {
        let current = self.parameters.bytes();
        self.previous_parameters.resize(current.len(), 0);
        self.previous_parameters.copy_from_slice(current);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::data_set::{ColumnDesc, DataSet, DataSetLayout};
    use std::sync::atomic::Ordering;

    fn noop_script(role: ScriptRole) -> Arc<CompiledScript> {
        Arc::new(CompiledScript::new(
            "test.script",
            role,
            ParameterLayout::new(&[("DeltaTime", 4)]),
            Arc::new(FnVm(|_args: &mut VmArgs<'_, '_>| true)),
        ))
    }

    fn particle_set(rows: usize) -> DataSet {
        let mut ds = DataSet::new(
            DataSetLayout::new(vec![ColumnDesc::float("Age")]),
            8,
        );
        ds.resize(rows);
        ds
    }

    #[test]
    fn test_init_transitions_to_ready() {
        let mut ctx = ScriptExecutionContext::new();
        assert_eq!(ctx.state(), ContextState::Uninitialized);
        ctx.init(noop_script(ScriptRole::ParticleUpdate), vec![]).unwrap();
        assert_eq!(ctx.state(), ContextState::Ready);
    }

    #[test]
    fn test_init_fails_on_unready_script() {
        let script = Arc::new(
            CompiledScript::new(
                "late.script",
                ScriptRole::ParticleSpawn,
                ParameterLayout::empty(),
                Arc::new(FnVm(|_args: &mut VmArgs<'_, '_>| true)),
            )
            .with_readiness(false),
        );
        let mut ctx = ScriptExecutionContext::new();
        assert!(matches!(
            ctx.init(script, vec![]),
            Err(Error::ScriptNotReady(_))
        ));
        assert_eq!(ctx.state(), ContextState::Failed);
    }

    #[test]
    fn test_init_fails_on_missing_interface() {
        let script = Arc::new(
            CompiledScript::new(
                "di.script",
                ScriptRole::ParticleUpdate,
                ParameterLayout::empty(),
                Arc::new(FnVm(|_args: &mut VmArgs<'_, '_>| true)),
            )
            .with_data_interfaces(vec!["Mesh".to_string()]),
        );
        let mut ctx = ScriptExecutionContext::new();
        assert!(matches!(
            ctx.init(script, vec![]),
            Err(Error::BindFailure { .. })
        ));
        assert_eq!(ctx.state(), ContextState::Failed);
    }

    #[test]
    fn test_tick_regenerates_function_table_on_shape_change() {
        let interface = StubInterface::new("Mesh");
        let script = Arc::new(
            CompiledScript::new(
                "di.script",
                ScriptRole::ParticleUpdate,
                ParameterLayout::empty(),
                Arc::new(FnVm(|_args: &mut VmArgs<'_, '_>| true)),
            )
            .with_data_interfaces(vec!["Mesh".to_string()]),
        );
        let mut ctx = ScriptExecutionContext::new();
        ctx.init(script, vec![interface.clone()]).unwrap();
        let v1 = ctx.function_table_version();

        assert!(ctx.tick());
        assert_eq!(ctx.function_table_version(), v1);

        interface.shape.store(2, Ordering::SeqCst);
        assert!(ctx.tick());
        assert_eq!(ctx.function_table_version(), v1 + 1);
    }

    #[test]
    fn test_tick_bind_failure_enters_failed() {
        let interface = StubInterface::new("Mesh");
        let script = Arc::new(
            CompiledScript::new(
                "di.script",
                ScriptRole::ParticleUpdate,
                ParameterLayout::empty(),
                Arc::new(FnVm(|_args: &mut VmArgs<'_, '_>| true)),
            )
            .with_data_interfaces(vec!["Mesh".to_string()]),
        );
        let mut ctx = ScriptExecutionContext::new();
        ctx.init(script, vec![interface.clone()]).unwrap();

        interface.shape.store(3, Ordering::SeqCst);
        interface.bind_ok.store(false, Ordering::SeqCst);
        assert!(!ctx.tick());
        assert_eq!(ctx.state(), ContextState::Failed);
        // Failed is non-retryable
        assert!(!ctx.tick());
    }

    #[test]
    fn test_execute_mutates_bound_slot() {
        let script = Arc::new(CompiledScript::new(
            "age.script",
            ScriptRole::ParticleUpdate,
            ParameterLayout::empty(),
            Arc::new(FnVm(|args: &mut VmArgs<'_, '_>| {
                let start = args.slots[0].start_row;
                let data = args.slots[0].data.get_mut().unwrap();
                for row in start..start + args.num_rows {
                    let age = data.get_f32(0, row);
                    data.set_f32(0, row, age + args.dt);
                }
                true
            })),
        ));
        let mut ctx = ScriptExecutionContext::new();
        ctx.init(script, vec![]).unwrap();
        ctx.bind_data(0, 0, true);

        let mut ds = particle_set(3);
        ctx.execute(vec![SlotData::Mut(&mut ds)], 3, 0.5, &[]).unwrap();
        for row in 0..3 {
            assert_eq!(ds.get_f32(0, row), 0.5);
        }
    }

    #[test]
    fn test_execute_failure_returns_error() {
        let script = Arc::new(CompiledScript::new(
            "bad.script",
            ScriptRole::ParticleSpawn,
            ParameterLayout::empty(),
            Arc::new(FnVm(|_args: &mut VmArgs<'_, '_>| false)),
        ));
        let mut ctx = ScriptExecutionContext::new();
        ctx.init(script, vec![]).unwrap();
        ctx.bind_data(0, 0, true);

        let mut ds = particle_set(1);
        assert!(matches!(
            ctx.execute(vec![SlotData::Mut(&mut ds)], 1, 0.1, &[]),
            Err(Error::ExecutionFailed(_))
        ));
    }

    #[test]
    fn test_update_script_growth_is_clamped() {
        let script = Arc::new(CompiledScript::new(
            "growing.update",
            ScriptRole::ParticleUpdate,
            ParameterLayout::empty(),
            Arc::new(FnVm(|args: &mut VmArgs<'_, '_>| {
                let data = args.slots[0].data.get_mut().unwrap();
                data.resize(data.active_rows() + 5);
                true
            })),
        ));
        let mut ctx = ScriptExecutionContext::new();
        ctx.init(script, vec![]).unwrap();
        ctx.bind_data(0, 0, true);

        let mut ds = particle_set(2);
        ctx.execute(vec![SlotData::Mut(&mut ds)], 2, 0.1, &[]).unwrap();
        assert_eq!(ds.active_rows(), 2);
    }

    #[test]
    fn test_post_tick_runs_once_per_tick() {
        let mut ctx = ScriptExecutionContext::new();
        ctx.init(noop_script(ScriptRole::ParticleUpdate), vec![]).unwrap();

        ctx.parameters_mut().set_f32("DeltaTime", 0.25);
        ctx.tick();
        ctx.post_tick();
        assert_eq!(&ctx.previous_parameters, &0.25f32.to_le_bytes());

        // A second PostTick in the same frame must not further mutate the
        // already-primed previous buffer.
        ctx.parameters_mut().set_f32("DeltaTime", 0.75);
        ctx.post_tick();
        assert_eq!(&ctx.previous_parameters, &0.25f32.to_le_bytes());

        // Next tick re-arms it
        ctx.tick();
        ctx.post_tick();
        assert_eq!(&ctx.previous_parameters, &0.75f32.to_le_bytes());
    }

    #[test]
    fn test_constants_expose_current_and_previous() {
        let observed = std::sync::Arc::new(std::sync::Mutex::new((0.0f32, 0.0f32)));
        let observed_vm = observed.clone();
        let script = Arc::new(CompiledScript::new(
            "const.script",
            ScriptRole::ParticleUpdate,
            ParameterLayout::new(&[("Rate", 4)]),
            Arc::new(FnVm(move |args: &mut VmArgs<'_, '_>| {
                let current = args.constants.f32_at(0, 0);
                let previous = args.constants.f32_at(1, 0);
                *observed_vm.lock().unwrap() = (current, previous);
                true
            })),
        ));
        let mut ctx = ScriptExecutionContext::new();
        ctx.init(script, vec![]).unwrap();
        ctx.bind_data(0, 0, true);

        ctx.parameters_mut().set_f32("Rate", 2.0);
        ctx.tick();
        ctx.post_tick();
        ctx.tick();
        ctx.parameters_mut().set_f32("Rate", 3.0);

        let mut ds = particle_set(1);
        ctx.execute(vec![SlotData::Mut(&mut ds)], 1, 0.1, &[]).unwrap();
        assert_eq!(*observed.lock().unwrap(), (3.0, 2.0));
    }
}
