//! Device buffers and host views.
//!
//! # Storage modes
//!
//! | Mode      | Host access                | Device sync                         |
//! |-----------|----------------------------|-------------------------------------|
//! | `Shared`  | direct                     | none (data races are the caller's)  |
//! | `Managed` | host copy                  | [`Buffer::did_modify_range`], blit `synchronize` |
//! | `Private` | none: `upload` / `download`| n/a                                 |
//!
//! On unified-memory devices [`Buffer::download`] of a shared buffer is a
//! view of device memory, not a copy ([`BufferView::is_zero_copy`]). The
//! view aliases the buffer: finish GPU work before taking it, drop it
//! before committing more work.

use std::ops::{Deref, Range};
use std::sync::{Arc, MutexGuard, RwLockReadGuard};

use bytemuck::Pod;

use crate::backend::cpu::CpuBuffer;
use crate::device::Device;
use crate::resource::{DeviceId, ResourceKind, Tracked};
use crate::{ComputeError, ComputeResult};

#[cfg(feature = "wgpu")]
use crate::backend::wgpu_backend::{MappedView, WgpuBuffer};

/// CPU/GPU visibility policy of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StorageMode {
    /// Host and device access the same memory.
    #[default]
    Shared,
    /// Separate host and device copies, synchronised explicitly.
    Managed,
    /// Device-only.
    Private,
}

impl StorageMode {
    /// Whether [`Buffer::contents`] is allowed.
    pub fn is_host_visible(&self) -> bool {
        !matches!(self, Self::Private)
    }
}

pub(crate) enum RawBuffer {
    Cpu(CpuBuffer),
    #[cfg(feature = "wgpu")]
    Wgpu(WgpuBuffer),
}

impl RawBuffer {
    pub(crate) fn as_cpu(&self) -> Option<&CpuBuffer> {
        match self {
            Self::Cpu(b) => Some(b),
            #[cfg(feature = "wgpu")]
            _ => None,
        }
    }

    #[cfg(feature = "wgpu")]
    pub(crate) fn as_wgpu(&self) -> Option<&WgpuBuffer> {
        match self {
            Self::Wgpu(b) => Some(b),
            _ => None,
        }
    }
}

/// A contiguous device memory region.
///
/// Cloning retains the buffer; it is released when the last clone and the
/// last command buffer referencing it are gone.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    device: DeviceId,
    len: usize,
    mode: StorageMode,
    raw: RawBuffer,
    _tracked: Tracked,
}

impl Buffer {
    pub(crate) fn from_raw(device: &Device, len: usize, mode: StorageMode, raw: RawBuffer) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                device: device.id(),
                len,
                mode,
                raw,
                _tracked: Tracked::new(device.counters(), ResourceKind::Buffer),
            }),
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Always `false`: zero-length buffers cannot be created.
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.inner.mode
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.device
    }

    pub(crate) fn raw(&self) -> &RawBuffer {
        &self.inner.raw
    }

    pub(crate) fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Validates a host transfer range: inside the buffer, 4-byte aligned
    /// offset, and a 4-byte multiple length unless it ends the buffer.
    fn check_range(&self, offset: usize, len: usize) -> ComputeResult<()> {
        let end = offset.saturating_add(len);
        let aligned = offset % 4 == 0 && (len % 4 == 0 || end == self.len());
        if end > self.len() || !aligned {
            return Err(ComputeError::InvalidRange { offset, end, len: self.len() });
        }
        Ok(())
    }

    /// Writes `bytes` at `offset`, visible to work committed afterwards.
    ///
    /// Works in every storage mode (private buffers go through a staging
    /// copy). Managed buffers update both copies.
    pub fn upload(&self, offset: usize, bytes: &[u8]) -> ComputeResult<()> {
        self.check_range(offset, bytes.len())?;
        match self.raw() {
            RawBuffer::Cpu(b) => {
                b.write(offset, bytes);
                Ok(())
            }
            #[cfg(feature = "wgpu")]
            RawBuffer::Wgpu(b) => b.upload(offset, bytes),
        }
    }

    /// Writes the host copy only.
    ///
    /// For shared buffers this is the device memory. Managed buffers need
    /// [`did_modify_range`](Self::did_modify_range) before the device sees
    /// the change.
    pub fn write_contents(&self, offset: usize, bytes: &[u8]) -> ComputeResult<()> {
        if !self.storage_mode().is_host_visible() {
            return Err(ComputeError::HostAccess { mode: self.storage_mode() });
        }
        self.check_range(offset, bytes.len())?;
        match self.raw() {
            RawBuffer::Cpu(b) => {
                b.write(offset, bytes);
                Ok(())
            }
            #[cfg(feature = "wgpu")]
            RawBuffer::Wgpu(b) => b.write_contents(offset, bytes),
        }
    }

    /// Host view of the buffer.
    ///
    /// Fails with [`ComputeError::HostAccess`] for private buffers.
    pub fn contents(&self) -> ComputeResult<BufferView<'_>> {
        if !self.storage_mode().is_host_visible() {
            return Err(ComputeError::HostAccess { mode: self.storage_mode() });
        }
        match self.raw() {
            RawBuffer::Cpu(b) => Ok(b.view(self.len())),
            #[cfg(feature = "wgpu")]
            RawBuffer::Wgpu(b) => b.contents(self.len()),
        }
    }

    /// Reads the buffer back from the device.
    ///
    /// A zero-copy view for shared buffers on unified memory, an owned copy
    /// otherwise.
    pub fn download(&self) -> ComputeResult<BufferView<'_>> {
        match self.raw() {
            RawBuffer::Cpu(b) => match self.storage_mode() {
                StorageMode::Private => Ok(BufferView::owned(b.copy(self.len()))),
                _ => Ok(b.view(self.len())),
            },
            #[cfg(feature = "wgpu")]
            RawBuffer::Wgpu(b) => b.download(self.len()),
        }
    }

    /// Pushes host writes in `range` of a managed buffer to the device.
    /// No-op for other modes.
    pub fn did_modify_range(&self, range: Range<usize>) -> ComputeResult<()> {
        if range.start > range.end || range.end > self.len() {
            return Err(ComputeError::InvalidRange { offset: range.start, end: range.end, len: self.len() });
        }
        if self.storage_mode() != StorageMode::Managed {
            return Ok(());
        }
        match self.raw() {
            RawBuffer::Cpu(_) => Ok(()),
            #[cfg(feature = "wgpu")]
            RawBuffer::Wgpu(b) => b.flush_shadow(range),
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.inner.len)
            .field("mode", &self.inner.mode)
            .field("device", &self.inner.device)
            .finish()
    }
}

// =============================================================================
// BufferView
// =============================================================================

pub(crate) enum ViewRepr<'a> {
    Owned(Vec<u8>),
    Host { guard: RwLockReadGuard<'a, Vec<u32>>, len: usize },
    #[cfg_attr(not(feature = "wgpu"), allow(dead_code))]
    Shadow { guard: MutexGuard<'a, Vec<u8>>, len: usize },
    #[cfg(feature = "wgpu")]
    Mapped(MappedView<'a>),
}

/// Bytes of a buffer as seen by the host.
///
/// Either a view of the buffer's memory or an owned copy. Dereferences to
/// `[u8]`.
pub struct BufferView<'a> {
    repr: ViewRepr<'a>,
}

impl<'a> BufferView<'a> {
    pub(crate) fn new(repr: ViewRepr<'a>) -> Self {
        Self { repr }
    }

    pub(crate) fn owned(bytes: Vec<u8>) -> Self {
        Self { repr: ViewRepr::Owned(bytes) }
    }

    /// Whether this view aliases device memory.
    pub fn is_zero_copy(&self) -> bool {
        match &self.repr {
            ViewRepr::Owned(_) | ViewRepr::Shadow { .. } => false,
            ViewRepr::Host { .. } => true,
            #[cfg(feature = "wgpu")]
            ViewRepr::Mapped(_) => true,
        }
    }

    /// Copies the bytes out as `T` values.
    pub fn to_vec_of<T: Pod>(&self) -> Vec<T> {
        bytemuck::pod_collect_to_vec(self)
    }
}

impl Deref for BufferView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.repr {
            ViewRepr::Owned(v) => v,
            ViewRepr::Host { guard, len } => &bytemuck::cast_slice::<u32, u8>(guard)[..*len],
            ViewRepr::Shadow { guard, len } => &guard[..*len],
            #[cfg(feature = "wgpu")]
            ViewRepr::Mapped(m) => m.bytes(),
        }
    }
}

impl std::fmt::Debug for BufferView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("len", &self.len())
            .field("zero_copy", &self.is_zero_copy())
            .finish()
    }
}
