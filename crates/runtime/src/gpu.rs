//! GPU dispatch batching
//!
//! GPU-simulated emitters do not run their scripts on the CPU; each frame
//! they enqueue a [`GpuComputeContext`] describing the dispatch, and a
//! backend consumes the batch after the frame's CPU work completes. Row
//! counts written by GPU scripts arrive back asynchronously as
//! [`CountReadback`]s, typically a few frames late.

use tracing::trace;

use crate::types::EmitterId;

/// Everything a backend needs to dispatch one emitter's GPU script
#[derive(Debug, Clone)]
pub struct GpuComputeContext {
    pub emitter: EmitterId,
    /// CPU-side row count at enqueue time; the GPU may change it
    pub num_rows: usize,
    /// Snapshot of the GPU script's constant buffer
    pub constants: Vec<u8>,
}

/// Asynchronous row-count readback from a completed GPU dispatch
#[derive(Debug, Clone)]
pub struct CountReadback {
    pub emitter: EmitterId,
    /// Frame the dispatch was enqueued on
    pub frame: u64,
    pub num_rows: usize,
}

/// Per-frame sink for GPU dispatch work.
pub trait GpuBatcher: Send {
    fn enqueue(&mut self, ctx: GpuComputeContext);
}

/// Batcher that collects dispatch contexts in enqueue order for a backend to
/// drain once per frame.
#[derive(Debug, Default)]
pub struct FrameBatcher {
    pending: Vec<GpuComputeContext>,
    readbacks: Vec<CountReadback>,
}

impl FrameBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &[GpuComputeContext] {
        &self.pending
    }

    /// Hand the frame's dispatches to the backend, clearing the batch.
    pub fn drain(&mut self) -> Vec<GpuComputeContext> {
        trace!(count = self.pending.len(), "draining gpu batch");
        std::mem::take(&mut self.pending)
    }

    /// Backend-delivered readback; surfaced to owners next frame.
    pub fn push_readback(&mut self, readback: CountReadback) {
        self.readbacks.push(readback);
    }

    pub fn take_readbacks(&mut self) -> Vec<CountReadback> {
        std::mem::take(&mut self.readbacks)
    }
}

impl GpuBatcher for FrameBatcher {
    fn enqueue(&mut self, ctx: GpuComputeContext) {
        self.pending.push(ctx);
    }
}
