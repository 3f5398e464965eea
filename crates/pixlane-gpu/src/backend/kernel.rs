//! Host kernels: the CPU backend's counterpart of shader entry points.
//!
//! A host kernel is registered under the name of the WGSL entry point it
//! implements. At dispatch it receives the grid, the threadgroup shape and
//! the resources bound to every slot the entry point uses, already locked
//! with the access the shader declares (`read` vs `read_write`).

use std::collections::BTreeMap;
use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};

use bytemuck::Pod;
use pixlane_core::pixel::{decode_texel, encode_texel};
use pixlane_core::{DispatchSize, TextureFormat, ThreadgroupSize};

use crate::encoder::{BoundBuffer, Bindings};
use crate::library::{BindingInfo, BindingKind};
use crate::{ComputeError, ComputeResult};

/// Host implementation of a compute entry point.
pub type HostKernel = Arc<dyn Fn(&mut KernelArgs<'_>) -> ComputeResult<()> + Send + Sync>;

fn slot_error(kind: &str, slot: u32, msg: impl std::fmt::Display) -> ComputeError {
    ComputeError::Execution(format!("{kind} slot {slot}: {msg}"))
}

/// Arguments of one host kernel invocation.
pub struct KernelArgs<'a> {
    pub grid: DispatchSize,
    pub threadgroup: ThreadgroupSize,
    pub buffers: BufferSlots<'a>,
    pub textures: TextureSlots<'a>,
}

impl KernelArgs<'_> {
    /// Launched threads along x and y, saturated to `u32`.
    ///
    /// Kernels must not touch elements outside this extent, matching what
    /// the GPU would execute for the same dispatch.
    pub fn thread_extent(&self) -> (u32, u32) {
        let [x, y, _] = self.grid.threads(self.threadgroup);
        (x.min(u32::MAX as u64) as u32, y.min(u32::MAX as u64) as u32)
    }
}

// =============================================================================
// Buffers
// =============================================================================

enum BufferSlot<'a> {
    Read { guard: RwLockReadGuard<'a, Vec<u32>>, start: usize, end: usize },
    Write { guard: RwLockWriteGuard<'a, Vec<u32>>, start: usize, end: usize },
    Bytes(&'a [u8]),
}

impl BufferSlot<'_> {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Read { guard, start, end } => &bytemuck::cast_slice::<u32, u8>(guard)[*start..*end],
            Self::Write { guard, start, end } => &bytemuck::cast_slice::<u32, u8>(guard)[*start..*end],
            Self::Bytes(b) => *b,
        }
    }

    fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Self::Write { guard, start, end } => {
                Some(&mut bytemuck::cast_slice_mut::<u32, u8>(guard)[*start..*end])
            }
            _ => None,
        }
    }
}

/// Buffer slots bound for one dispatch.
#[derive(Default)]
pub struct BufferSlots<'a> {
    slots: BTreeMap<u32, BufferSlot<'a>>,
}

impl BufferSlots<'_> {
    fn get(&self, slot: u32) -> ComputeResult<&[u8]> {
        self.slots
            .get(&slot)
            .map(BufferSlot::bytes)
            .ok_or_else(|| slot_error("buffer", slot, "not used by this entry point"))
    }

    /// Raw bytes at `slot`, starting at the bound offset.
    pub fn bytes(&self, slot: u32) -> ComputeResult<&[u8]> {
        self.get(slot)
    }

    /// Typed read-only view of `slot`.
    pub fn read<T: Pod>(&self, slot: u32) -> ComputeResult<&[T]> {
        bytemuck::try_cast_slice(self.get(slot)?).map_err(|e| slot_error("buffer", slot, format!("{e:?}")))
    }

    /// Typed writable view of `slot`. The slot must be `read_write` storage.
    pub fn write<T: Pod>(&mut self, slot: u32) -> ComputeResult<&mut [T]> {
        let entry = self
            .slots
            .get_mut(&slot)
            .ok_or_else(|| slot_error("buffer", slot, "not used by this entry point"))?;
        let bytes = entry
            .bytes_mut()
            .ok_or_else(|| slot_error("buffer", slot, "bound read-only"))?;
        bytemuck::try_cast_slice_mut(bytes).map_err(|e| slot_error("buffer", slot, format!("{e:?}")))
    }

    /// First `size_of::<T>()` bytes of `slot`, e.g. a uniform struct.
    pub fn uniform<T: Pod>(&self, slot: u32) -> ComputeResult<T> {
        let bytes = self.get(slot)?;
        let size = std::mem::size_of::<T>();
        if bytes.len() < size {
            return Err(slot_error("buffer", slot, format!("holds {} bytes, needs {size}", bytes.len())));
        }
        Ok(bytemuck::pod_read_unaligned(&bytes[..size]))
    }

    /// Read-only `src` and writable `dst` at once.
    pub fn split<S: Pod, D: Pod>(&mut self, src: u32, dst: u32) -> ComputeResult<(&[S], &mut [D])> {
        if src == dst {
            return Err(slot_error("buffer", dst, "cannot split a slot with itself"));
        }
        let mut src_slot = None;
        let mut dst_slot = None;
        for (k, v) in self.slots.iter_mut() {
            if *k == src {
                src_slot = Some(v);
            } else if *k == dst {
                dst_slot = Some(v);
            }
        }
        let src_slot = src_slot.ok_or_else(|| slot_error("buffer", src, "not used by this entry point"))?;
        let dst_slot = dst_slot.ok_or_else(|| slot_error("buffer", dst, "not used by this entry point"))?;
        let src_bytes = BufferSlot::bytes(src_slot);
        let dst_bytes = dst_slot
            .bytes_mut()
            .ok_or_else(|| slot_error("buffer", dst, "bound read-only"))?;
        let s = bytemuck::try_cast_slice(src_bytes).map_err(|e| slot_error("buffer", src, format!("{e:?}")))?;
        let d = bytemuck::try_cast_slice_mut(dst_bytes).map_err(|e| slot_error("buffer", dst, format!("{e:?}")))?;
        Ok((s, d))
    }
}

// =============================================================================
// Textures
// =============================================================================

enum TextureSlot<'a> {
    Read(RwLockReadGuard<'a, Vec<u8>>),
    Write(RwLockWriteGuard<'a, Vec<u8>>),
}

struct TextureEntry<'a> {
    data: TextureSlot<'a>,
    width: u32,
    height: u32,
    format: TextureFormat,
}

/// Texture slots bound for one dispatch.
#[derive(Default)]
pub struct TextureSlots<'a> {
    slots: BTreeMap<u32, TextureEntry<'a>>,
}

impl TextureSlots<'_> {
    /// Read view of `slot`.
    pub fn read(&self, slot: u32) -> ComputeResult<TexelView<'_>> {
        let entry = self
            .slots
            .get(&slot)
            .ok_or_else(|| slot_error("texture", slot, "not used by this entry point"))?;
        let data: &[u8] = match &entry.data {
            TextureSlot::Read(g) => &g[..],
            TextureSlot::Write(g) => &g[..],
        };
        Ok(TexelView { data, width: entry.width, height: entry.height, format: entry.format })
    }

    /// Write view of `slot`. The slot must be a storage texture.
    pub fn write(&mut self, slot: u32) -> ComputeResult<TexelViewMut<'_>> {
        let entry = self
            .slots
            .get_mut(&slot)
            .ok_or_else(|| slot_error("texture", slot, "not used by this entry point"))?;
        let (width, height, format) = (entry.width, entry.height, entry.format);
        match &mut entry.data {
            TextureSlot::Write(g) => Ok(TexelViewMut { data: &mut g[..], width, height, format }),
            TextureSlot::Read(_) => Err(slot_error("texture", slot, "bound as a sampled texture")),
        }
    }
}

/// Read access to a texture's texels.
#[derive(Clone, Copy)]
pub struct TexelView<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
    format: TextureFormat,
}

impl TexelView<'_> {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Texel at `(x, y)` as RGBA, like WGSL `textureLoad`. Out-of-range
    /// coordinates read zero.
    pub fn load(&self, x: u32, y: u32) -> [f32; 4] {
        if x >= self.width || y >= self.height {
            return [0.0; 4];
        }
        let bpp = self.format.bytes_per_pixel();
        let i = (y as usize * self.width as usize + x as usize) * bpp;
        decode_texel(self.format, &self.data[i..i + bpp])
    }
}

/// Write access to a storage texture's texels.
pub struct TexelViewMut<'a> {
    data: &'a mut [u8],
    width: u32,
    height: u32,
    format: TextureFormat,
}

impl TexelViewMut<'_> {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Stores RGBA at `(x, y)`, like WGSL `textureStore`. Out-of-range
    /// coordinates are ignored.
    pub fn store(&mut self, x: u32, y: u32, rgba: [f32; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let bpp = self.format.bytes_per_pixel();
        let i = (y as usize * self.width as usize + x as usize) * bpp;
        encode_texel(self.format, rgba, &mut self.data[i..i + bpp]);
    }

    /// Tightly packed texel rows.
    pub fn rows_mut(&mut self) -> std::slice::ChunksExactMut<'_, u8> {
        let row = self.format.row_bytes(self.width);
        self.data.chunks_exact_mut(row)
    }
}

// =============================================================================
// Binding
// =============================================================================

/// Locks every resource of `bindings` with the access `used` declares.
///
/// Uses `try_*` locks: a resource that is mapped on the host, or bound
/// twice with conflicting access, fails the dispatch instead of blocking.
pub(crate) fn lock_bindings<'a>(
    bindings: &'a Bindings,
    used: &[BindingInfo],
) -> ComputeResult<(BufferSlots<'a>, TextureSlots<'a>)> {
    let mut buffers = BufferSlots::default();
    let mut textures = TextureSlots::default();

    for info in used {
        let slot = info.slot;
        match info.kind {
            BindingKind::StorageBuffer { .. } | BindingKind::UniformBuffer => {
                let Some(bound) = bindings.buffers.get(&slot) else {
                    return Err(slot_error("buffer", slot, "not bound"));
                };
                let entry = match bound {
                    BoundBuffer::Bytes(bytes) => BufferSlot::Bytes(&bytes[..]),
                    BoundBuffer::Buffer { buffer, offset } => {
                        let Some(raw) = buffer.raw().as_cpu() else {
                            return Err(slot_error("buffer", slot, "not host-backed"));
                        };
                        let (start, end) = (*offset, buffer.len());
                        if info.kind.is_writable() {
                            let guard = raw
                                .words
                                .try_write()
                                .map_err(|_| slot_error("buffer", slot, "in use by the host or another slot"))?;
                            BufferSlot::Write { guard, start, end }
                        } else {
                            let guard = raw
                                .words
                                .try_read()
                                .map_err(|_| slot_error("buffer", slot, "in use by the host or another slot"))?;
                            BufferSlot::Read { guard, start, end }
                        }
                    }
                };
                buffers.slots.insert(slot, entry);
            }
            BindingKind::SampledTexture | BindingKind::StorageTexture { .. } => {
                let Some(texture) = bindings.textures.get(&slot) else {
                    return Err(slot_error("texture", slot, "not bound"));
                };
                let Some(raw) = texture.raw().as_cpu() else {
                    return Err(slot_error("texture", slot, "not host-backed"));
                };
                let data = if info.kind.is_writable() {
                    TextureSlot::Write(
                        raw.texels
                            .try_write()
                            .map_err(|_| slot_error("texture", slot, "in use by the host or another slot"))?,
                    )
                } else {
                    TextureSlot::Read(
                        raw.texels
                            .try_read()
                            .map_err(|_| slot_error("texture", slot, "in use by the host or another slot"))?,
                    )
                };
                textures.slots.insert(
                    slot,
                    TextureEntry { data, width: texture.width(), height: texture.height(), format: texture.format() },
                );
            }
        }
    }

    Ok((buffers, textures))
}
