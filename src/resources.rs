//! Live-allocation accounting for transient frames and tensors.
//!
//! Every GPU frame and tensor created inside a tick holds a [`LiveAllocation`]
//! token. The token is released when its owner is dropped, on the success
//! path and on every early return alike, so after a tick the tracker must be
//! back at its baseline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Frame,
    Tensor,
}

#[derive(Debug, Default)]
struct Counters {
    frames: AtomicUsize,
    tensors: AtomicUsize,
    bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
}

impl Counters {
    fn slot(&self, kind: ResourceKind) -> &AtomicUsize {
        match kind {
            ResourceKind::Frame => &self.frames,
            ResourceKind::Tensor => &self.tensors,
        }
    }
}

/// Shared, lock-free counters. Cloning shares the same counters.
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    counters: Arc<Counters>,
}

/// Snapshot of the tracker at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceSnapshot {
    pub frames: usize,
    pub tensors: usize,
    pub bytes: usize,
    pub peak_bytes: usize,
}

impl ResourceSnapshot {
    pub fn live(&self) -> usize {
        self.frames + self.tensors
    }
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, kind: ResourceKind, bytes: usize) -> LiveAllocation {
        self.counters.slot(kind).fetch_add(1, Ordering::Relaxed);
        let prev = self.counters.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.counters
            .peak_bytes
            .fetch_max(prev + bytes, Ordering::Relaxed);
        LiveAllocation {
            counters: Arc::clone(&self.counters),
            kind,
            bytes,
        }
    }

    pub fn live(&self, kind: ResourceKind) -> usize {
        self.counters.slot(kind).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            frames: self.counters.frames.load(Ordering::Relaxed),
            tensors: self.counters.tensors.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
            peak_bytes: self.counters.peak_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Token for one live allocation. Released exactly once, on drop.
#[derive(Debug)]
pub struct LiveAllocation {
    counters: Arc<Counters>,
    kind: ResourceKind,
    bytes: usize,
}

impl Drop for LiveAllocation {
    fn drop(&mut self) {
        self.counters.slot(self.kind).fetch_sub(1, Ordering::Relaxed);
        self.counters.bytes.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}
