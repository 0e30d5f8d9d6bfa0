//! Columnar particle/instance storage
//!
//! A [`DataSet`] is a layout (ordered, named, float/int32 typed columns) plus
//! two frame buffers. Exactly one buffer is "current" outside an active
//! simulate pass; `begin_simulate`/`end_simulate` bracket a pass that writes
//! the destination buffer and publishes it on completion. Cells are 4-byte
//! words so float and int32 columns share one copy/transfer path.

use indexmap::IndexMap;
use tracing::trace;

/// Column element type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Float,
    Int32,
}

/// One named column in a layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnDesc {
    pub fn float(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ty: ColumnType::Float,
        }
    }

    pub fn int32(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ty: ColumnType::Int32,
        }
    }
}

/// Ordered list of named columns. Versioned so cached projections can detect
/// rebuilds (offsets move when a layout is rebuilt).
#[derive(Debug, Clone, Default)]
pub struct DataSetLayout {
    columns: Vec<ColumnDesc>,
    by_name: IndexMap<String, usize>,
    version: u32,
}

impl DataSetLayout {
    pub fn new(columns: Vec<ColumnDesc>) -> Self {
        let by_name = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        Self {
            columns,
            by_name,
            version: 1,
        }
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Whether every column of `self` matches `other` by name and type, in
    /// order. Required for row transfers between two DataSets.
    pub fn is_compatible(&self, other: &DataSetLayout) -> bool {
        self.columns == other.columns
    }

    /// Replace the column list, bumping the version.
    pub fn rebuild(&mut self, columns: Vec<ColumnDesc>) {
        let version = self.version + 1;
        *self = Self::new(columns);
        self.version = version;
    }
}

/// One frame buffer: per-column cell storage plus a row count
#[derive(Debug, Clone, Default)]
struct FrameBuffer {
    cells: Vec<Vec<u32>>,
    num_rows: usize,
}

impl FrameBuffer {
    fn with_columns(count: usize) -> Self {
        Self {
            cells: vec![Vec::new(); count],
            num_rows: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.cells.first().map_or(usize::MAX, |c| c.len())
    }

    fn grow_to(&mut self, rows: usize) {
        for column in &mut self.cells {
            if column.len() < rows {
                column.resize(rows, 0);
            }
        }
    }
}

/// Double-buffered columnar row store.
///
/// Row count always matches the size of whichever logical container
/// (instance list, particle list) the set backs. Storage grows geometrically
/// from a caller-supplied high-water estimate and never shrinks implicitly.
#[derive(Debug)]
pub struct DataSet {
    layout: DataSetLayout,
    buffers: [FrameBuffer; 2],
    current: usize,
    simulating: bool,
    high_water: usize,
}

impl DataSet {
    pub fn new(layout: DataSetLayout, high_water_estimate: usize) -> Self {
        let columns = layout.len();
        Self {
            layout,
            buffers: [
                FrameBuffer::with_columns(columns),
                FrameBuffer::with_columns(columns),
            ],
            current: 0,
            simulating: false,
            high_water: high_water_estimate.max(1),
        }
    }

    /// Replace the layout and drop all rows.
    pub fn init(&mut self, layout: DataSetLayout) {
        let columns = layout.len();
        self.layout = layout;
        self.buffers = [
            FrameBuffer::with_columns(columns),
            FrameBuffer::with_columns(columns),
        ];
        self.current = 0;
        self.simulating = false;
    }

    pub fn layout(&self) -> &DataSetLayout {
        &self.layout
    }

    /// Row count of the current (published) buffer
    pub fn num_rows(&self) -> usize {
        self.buffers[self.current].num_rows
    }

    pub fn is_simulating(&self) -> bool {
        self.simulating
    }

    /// Zero the row count of both buffers. Capacity is retained.
    pub fn reset(&mut self) {
        assert!(!self.simulating, "reset during an active simulate pass");
        self.buffers[0].num_rows = 0;
        self.buffers[1].num_rows = 0;
    }

    fn dest_index(&self) -> usize {
        1 - self.current
    }

    fn grown_capacity(&mut self, needed: usize) -> usize {
        let mut capacity = self.high_water;
        while capacity < needed {
            capacity *= 2;
        }
        // Ratchet: once grown, later passes allocate at least this much, so
        // capacity never ping-pongs between the two buffers.
        self.high_water = capacity;
        capacity
    }

    /// Start a simulate pass. The destination buffer becomes writable and is
    /// distinct from the current buffer until `end_simulate` publishes it.
    pub fn begin_simulate(&mut self) {
        assert!(!self.simulating, "begin_simulate while already simulating");
        self.simulating = true;
        self.buffers[self.dest_index()].num_rows = 0;
    }

    /// Grow destination storage to at least `rows`, optionally carrying the
    /// current buffer's rows over so scripts can mutate them in place.
    pub fn allocate(&mut self, rows: usize, keep_existing: bool) {
        assert!(self.simulating, "allocate outside a simulate pass");
        let capacity = self.grown_capacity(rows);
        let (cur, dst) = self.split_buffers();
        dst.grow_to(capacity);
        if keep_existing {
            let carry = cur.num_rows;
            for (src_col, dst_col) in cur.cells.iter().zip(dst.cells.iter_mut()) {
                dst_col[..carry].copy_from_slice(&src_col[..carry]);
            }
            dst.num_rows = carry;
        } else {
            dst.num_rows = 0;
        }
        trace!(rows, capacity, keep_existing, "dataset allocate");
    }

    /// Publish the destination buffer as the new current buffer, invalidating
    /// the prior current.
    pub fn end_simulate(&mut self) {
        assert!(self.simulating, "end_simulate without begin_simulate");
        self.current = self.dest_index();
        self.simulating = false;
    }

    fn split_buffers(&mut self) -> (&FrameBuffer, &mut FrameBuffer) {
        let dest = self.dest_index();
        if dest == 1 {
            let (a, b) = self.buffers.split_at_mut(1);
            (&a[0], &mut b[0])
        } else {
            let (a, b) = self.buffers.split_at_mut(1);
            (&b[0], &mut a[0])
        }
    }

    fn active_index(&self) -> usize {
        if self.simulating { self.dest_index() } else { self.current }
    }

    /// Row count of the buffer scripts currently write (destination during a
    /// simulate pass, current otherwise).
    pub fn active_rows(&self) -> usize {
        self.buffers[self.active_index()].num_rows
    }

    /// Append zero-filled rows to the active buffer, returning their range.
    pub fn append_rows(&mut self, count: usize) -> std::ops::Range<usize> {
        let idx = self.active_index();
        let start = self.buffers[idx].num_rows;
        let end = start + count;
        assert!(
            end <= self.buffers[idx].capacity(),
            "append past allocated capacity ({end} > {})",
            self.buffers[idx].capacity()
        );
        for column in &mut self.buffers[idx].cells {
            column[start..end].fill(0);
        }
        self.buffers[idx].num_rows = end;
        start..end
    }

    /// Append one zero-filled row to the active buffer, growing capacity as
    /// needed, and return its index. Used for game-thread row intake outside
    /// simulate passes.
    pub fn push_row(&mut self) -> usize {
        let idx = self.active_index();
        let row = self.buffers[idx].num_rows;
        let capacity = self.grown_capacity(row + 1);
        let buffer = &mut self.buffers[idx];
        buffer.grow_to(capacity);
        for column in &mut buffer.cells {
            column[row] = 0;
        }
        buffer.num_rows = row + 1;
        row
    }

    /// Shrink the active buffer's row count. Never grows.
    pub fn truncate(&mut self, rows: usize) {
        let idx = self.active_index();
        assert!(rows <= self.buffers[idx].num_rows, "truncate cannot grow");
        self.buffers[idx].num_rows = rows;
    }

    /// Grow or shrink the active buffer's row count directly, allocating as
    /// needed. Intended for scratch row sets rebuilt every frame.
    pub fn resize(&mut self, rows: usize) {
        let capacity = self.grown_capacity(rows.max(1));
        let idx = self.active_index();
        let buffer = &mut self.buffers[idx];
        buffer.grow_to(capacity);
        buffer.num_rows = rows;
    }

    fn cell_at(&self, buffer: usize, column: usize, row: usize) -> u32 {
        let buf = &self.buffers[buffer];
        assert!(row < buf.num_rows, "row {row} out of range ({})", buf.num_rows);
        buf.cells[column][row]
    }

    fn set_cell_at(&mut self, buffer: usize, column: usize, row: usize, cell: u32) {
        let buf = &mut self.buffers[buffer];
        assert!(row < buf.num_rows, "row {row} out of range ({})", buf.num_rows);
        buf.cells[column][row] = cell;
    }

    /// Raw 4-byte cell in the active buffer
    pub fn cell(&self, column: usize, row: usize) -> u32 {
        self.cell_at(self.active_index(), column, row)
    }

    pub fn set_cell(&mut self, column: usize, row: usize, cell: u32) {
        let idx = self.active_index();
        self.set_cell_at(idx, column, row, cell);
    }

    pub fn get_f32(&self, column: usize, row: usize) -> f32 {
        f32::from_bits(self.cell(column, row))
    }

    pub fn set_f32(&mut self, column: usize, row: usize, value: f32) {
        self.set_cell(column, row, value.to_bits());
    }

    pub fn get_i32(&self, column: usize, row: usize) -> i32 {
        self.cell(column, row) as i32
    }

    pub fn set_i32(&mut self, column: usize, row: usize, value: i32) {
        self.set_cell(column, row, value as u32);
    }

    /// Remove row `row` from the current buffer by swapping the last row into
    /// its place (order is not preserved). Returns the index of the row that
    /// moved, if any.
    pub fn kill_instance(&mut self, row: usize) -> Option<usize> {
        assert!(!self.simulating, "kill_instance during a simulate pass");
        let buffer = &mut self.buffers[self.current];
        assert!(row < buffer.num_rows, "kill_instance row out of range");
        let last = buffer.num_rows - 1;
        if row != last {
            for column in &mut buffer.cells {
                column.swap(row, last);
            }
        }
        buffer.num_rows = last;
        (row != last).then_some(last)
    }

    /// Copy one row's full column data from `src`'s current buffer into this
    /// set's current buffer, returning the destination row index. The only
    /// sanctioned way to move an entity between two simulations without
    /// losing accumulated state.
    pub fn transfer_instance(
        &mut self,
        src: &mut DataSet,
        src_row: usize,
        remove_from_src: bool,
    ) -> usize {
        assert!(
            !self.simulating && !src.simulating,
            "transfer_instance during a simulate pass"
        );
        assert!(
            self.layout.is_compatible(&src.layout),
            "transfer_instance between incompatible layouts"
        );
        assert!(src_row < src.num_rows(), "transfer_instance row out of range");

        let dest_row = self.num_rows();
        let capacity = self.grown_capacity(dest_row + 1);
        let buffer = &mut self.buffers[self.current];
        buffer.grow_to(capacity);
        buffer.num_rows = dest_row + 1;
        for (dst_col, src_col) in buffer
            .cells
            .iter_mut()
            .zip(src.buffers[src.current].cells.iter())
        {
            dst_col[dest_row] = src_col[src_row];
        }

        if remove_from_src {
            src.kill_instance(src_row);
        }
        trace!(src_row, dest_row, remove_from_src, "row transferred");
        dest_row
    }
}
