//! Script-visible parameter storage
//!
//! A [`ParameterStore`] is a flat byte buffer of named parameters with a
//! dirty flag set on write. Parent→child fan-out is expressed as
//! [`StoreBinding`] objects owned by the child's owner and applied on an
//! explicit propagation pass; store↔DataSet projections are precomputed
//! offset-pair lists ([`DataSetProjection`]) that must be rebuilt whenever
//! either side's layout version changes.

use indexmap::IndexMap;
use tracing::trace;

use crate::data_set::{DataSet, DataSetLayout};

/// Cell size; parameters are 4-byte aligned like DataSet columns.
const CELL: usize = 4;

/// One named parameter in a layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDesc {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

/// Ordered, versioned parameter layout
#[derive(Debug, Clone, Default)]
pub struct ParameterLayout {
    params: Vec<ParamDesc>,
    by_name: IndexMap<String, usize>,
    size: usize,
    version: u32,
}

impl ParameterLayout {
    /// Build from (name, byte size) entries. Sizes must be 4-byte multiples.
    pub fn new(entries: &[(&str, usize)]) -> Self {
        let mut params = Vec::with_capacity(entries.len());
        let mut offset = 0;
        for (name, size) in entries {
            assert!(*size > 0 && size % CELL == 0, "parameter size must be a 4-byte multiple");
            params.push(ParamDesc {
                name: name.to_string(),
                offset,
                size: *size,
            });
            offset += size;
        }
        let by_name = params
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        Self {
            params,
            by_name,
            size: offset,
            version: 1,
        }
    }

    pub fn empty() -> Self {
        Self::new(&[])
    }

    pub fn params(&self) -> &[ParamDesc] {
        &self.params
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn param(&self, name: &str) -> Option<&ParamDesc> {
        self.by_name.get(name).map(|i| &self.params[*i])
    }

    /// Replace the parameter list, bumping the version (offsets may move).
    pub fn rebuild(&mut self, entries: &[(&str, usize)]) {
        let version = self.version + 1;
        *self = Self::new(entries);
        self.version = version;
    }
}

/// Named byte buffer of script-visible constants with dirty-tracking.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    layout: ParameterLayout,
    data: Vec<u8>,
    dirty: bool,
}

impl ParameterStore {
    pub fn new(layout: ParameterLayout) -> Self {
        let data = vec![0; layout.size()];
        Self {
            layout,
            data,
            dirty: false,
        }
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn slot(&self, name: &str) -> &ParamDesc {
        self.layout
            .param(name)
            .unwrap_or_else(|| panic!("unknown parameter {name}"))
    }

    pub fn write(&mut self, name: &str, bytes: &[u8]) {
        let desc = self.slot(name).clone();
        assert_eq!(desc.size, bytes.len(), "parameter {name} size mismatch");
        self.data[desc.offset..desc.offset + desc.size].copy_from_slice(bytes);
        self.dirty = true;
    }

    pub fn read(&self, name: &str) -> &[u8] {
        let desc = self.slot(name);
        &self.data[desc.offset..desc.offset + desc.size]
    }

    pub fn set_f32(&mut self, name: &str, value: f32) {
        self.write(name, &value.to_le_bytes());
    }

    pub fn get_f32(&self, name: &str) -> f32 {
        f32::from_le_bytes(self.read(name)[..4].try_into().unwrap())
    }

    pub fn set_i32(&mut self, name: &str, value: i32) {
        self.write(name, &value.to_le_bytes());
    }

    pub fn get_i32(&self, name: &str) -> i32 {
        i32::from_le_bytes(self.read(name)[..4].try_into().unwrap())
    }

    /// Replace the layout, preserving values of parameters that survive by
    /// name. Bumps the layout version, invalidating cached projections.
    pub fn relayout(&mut self, entries: &[(&str, usize)]) {
        let old_layout = std::mem::take(&mut self.layout);
        let old_data = std::mem::take(&mut self.data);
        let mut layout = old_layout.clone();
        layout.rebuild(entries);
        let mut data = vec![0; layout.size()];
        for param in layout.params() {
            if let Some(old) = old_layout.param(&param.name) {
                if old.size == param.size {
                    data[param.offset..param.offset + param.size]
                        .copy_from_slice(&old_data[old.offset..old.offset + old.size]);
                }
            }
        }
        self.layout = layout;
        self.data = data;
        self.dirty = true;
    }
}

/// Directed parent→child value propagation between two stores.
///
/// Owned by the child's owner; creating one is "Bind", dropping it is
/// "Unbind". A child may have several of these (multiple parents). The
/// offset-pair list is computed once and rebuilt lazily when either side's
/// layout version changes.
#[derive(Debug, Default)]
pub struct StoreBinding {
    pairs: Vec<(usize, usize, usize)>, // (src offset, dst offset, len)
    src_version: u32,
    dst_version: u32,
}

impl StoreBinding {
    pub fn new() -> Self {
        Self::default()
    }

    fn rebuild(&mut self, src: &ParameterLayout, dst: &ParameterLayout) {
        self.pairs.clear();
        for param in dst.params() {
            if let Some(source) = src.param(&param.name) {
                if source.size == param.size {
                    self.pairs.push((source.offset, param.offset, param.size));
                }
            }
        }
        self.src_version = src.version();
        self.dst_version = dst.version();
        trace!(pairs = self.pairs.len(), "store binding rebuilt");
    }

    fn is_valid(&self, src: &ParameterLayout, dst: &ParameterLayout) -> bool {
        self.src_version == src.version() && self.dst_version == dst.version()
    }

    /// Copy the parent's values into the child if the parent is dirty (or the
    /// binding had to be rebuilt). Marks the child dirty on copy.
    pub fn propagate(&mut self, parent: &ParameterStore, child: &mut ParameterStore) {
        let rebuilt = !self.is_valid(parent.layout(), child.layout());
        if rebuilt {
            self.rebuild(parent.layout(), child.layout());
        }
        if !parent.is_dirty() && !rebuilt {
            return;
        }
        for (src, dst, len) in &self.pairs {
            child.data[*dst..*dst + *len].copy_from_slice(&parent.data[*src..*src + *len]);
        }
        if !self.pairs.is_empty() {
            child.dirty = true;
        }
    }
}

/// Precomputed store↔DataSet column projection for one row at a time.
///
/// A single-cell parameter maps to the column with the same name; a
/// multi-cell parameter `P` of n cells maps to columns `P.0`..`P.{n-1}`.
/// An optional namespace remap rewrites a leading `From.` prefix to `To.`
/// before column lookup.
#[derive(Debug, Default)]
pub struct DataSetProjection {
    pairs: Vec<(usize, usize)>, // (store byte offset, column index)
    store_version: u32,
    layout_version: u32,
}

impl DataSetProjection {
    /// Compute the offset-pair list once; amortized O(1) thereafter.
    pub fn build(
        store: &ParameterLayout,
        layout: &DataSetLayout,
        namespace_remap: Option<(&str, &str)>,
    ) -> Self {
        let mut pairs = Vec::new();
        for param in store.params() {
            let name = match namespace_remap {
                Some((from, to)) => {
                    let prefix = format!("{from}.");
                    match param.name.strip_prefix(&prefix) {
                        Some(rest) => format!("{to}.{rest}"),
                        None => param.name.clone(),
                    }
                }
                None => param.name.clone(),
            };
            let cells = param.size / CELL;
            for cell in 0..cells {
                let column_name = if cells == 1 {
                    name.clone()
                } else {
                    format!("{name}.{cell}")
                };
                if let Some(column) = layout.column_index(&column_name) {
                    pairs.push((param.offset + cell * CELL, column));
                }
            }
        }
        trace!(pairs = pairs.len(), "dataset projection built");
        Self {
            pairs,
            store_version: store.version(),
            layout_version: layout.version(),
        }
    }

    /// Projections must be rebuilt whenever either side's layout is rebuilt.
    pub fn is_valid(&self, store: &ParameterLayout, layout: &DataSetLayout) -> bool {
        self.store_version == store.version() && self.layout_version == layout.version()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Apply the pairs store→DataSet for exactly one row.
    pub fn copy_to_data_set(&self, store: &ParameterStore, data: &mut DataSet, row: usize) {
        debug_assert!(self.is_valid(store.layout(), data.layout()), "stale projection");
        for (offset, column) in &self.pairs {
            let cell = u32::from_le_bytes(store.data[*offset..*offset + CELL].try_into().unwrap());
            data.set_cell(*column, row, cell);
        }
    }

    /// Apply the pairs DataSet→store for exactly one row.
    pub fn copy_from_data_set(&self, store: &mut ParameterStore, data: &DataSet, row: usize) {
        debug_assert!(self.is_valid(store.layout(), data.layout()), "stale projection");
        for (offset, column) in &self.pairs {
            let cell = data.cell(*column, row);
            store.data[*offset..*offset + CELL].copy_from_slice(&cell.to_le_bytes());
        }
        if !self.pairs.is_empty() {
            store.dirty = true;
        }
    }
}
