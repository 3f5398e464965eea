//! Resource identity and live-object accounting.
//!
//! Every native object sits behind an `Arc`: cloning a handle retains it,
//! dropping the last clone releases it. Each device keeps per-kind live
//! counters so callers (and tests) can check that failure paths and
//! completed command buffers leave nothing behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique device identifier.
///
/// Resources remember the device that created them; binding a resource
/// into a command buffer of another device is a programmer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    pub(crate) fn next() -> Self {
        Self(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResourceKind {
    Buffer,
    Texture,
    Library,
    Pipeline,
    Queue,
    CommandBuffer,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    buffers: AtomicUsize,
    textures: AtomicUsize,
    libraries: AtomicUsize,
    pipelines: AtomicUsize,
    queues: AtomicUsize,
    command_buffers: AtomicUsize,
}

impl Counters {
    fn slot(&self, kind: ResourceKind) -> &AtomicUsize {
        match kind {
            ResourceKind::Buffer => &self.buffers,
            ResourceKind::Texture => &self.textures,
            ResourceKind::Library => &self.libraries,
            ResourceKind::Pipeline => &self.pipelines,
            ResourceKind::Queue => &self.queues,
            ResourceKind::CommandBuffer => &self.command_buffers,
        }
    }

    pub(crate) fn snapshot(&self) -> ResourceCounts {
        ResourceCounts {
            buffers: self.buffers.load(Ordering::Acquire),
            textures: self.textures.load(Ordering::Acquire),
            libraries: self.libraries.load(Ordering::Acquire),
            pipelines: self.pipelines.load(Ordering::Acquire),
            queues: self.queues.load(Ordering::Acquire),
            command_buffers: self.command_buffers.load(Ordering::Acquire),
        }
    }
}

/// Counts one live object for as long as it exists.
///
/// Embedded in each resource's shared inner state, so the count drops
/// exactly when the last handle goes away.
#[derive(Debug)]
pub(crate) struct Tracked {
    counters: Arc<Counters>,
    kind: ResourceKind,
}

impl Tracked {
    pub(crate) fn new(counters: &Arc<Counters>, kind: ResourceKind) -> Self {
        counters.slot(kind).fetch_add(1, Ordering::AcqRel);
        Self { counters: Arc::clone(counters), kind }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.counters.slot(self.kind).fetch_sub(1, Ordering::AcqRel);
    }
}

/// Snapshot of live objects owned by one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub buffers: usize,
    pub textures: usize,
    pub libraries: usize,
    pub pipelines: usize,
    pub queues: usize,
    /// Command buffers still recording or in flight.
    pub command_buffers: usize,
}

impl ResourceCounts {
    /// Sum over all kinds.
    pub fn total(&self) -> usize {
        self.buffers + self.textures + self.libraries + self.pipelines + self.queues + self.command_buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_counts_clone_and_drop() {
        let counters = Arc::new(Counters::default());
        let a = Arc::new(Tracked::new(&counters, ResourceKind::Buffer));
        let b = Arc::clone(&a);
        assert_eq!(counters.snapshot().buffers, 1);
        drop(a);
        assert_eq!(counters.snapshot().buffers, 1);
        drop(b);
        assert_eq!(counters.snapshot(), ResourceCounts::default());
    }

    #[test]
    fn test_device_ids_unique() {
        assert_ne!(DeviceId::next(), DeviceId::next());
    }
}
