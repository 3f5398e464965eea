//! One-shot command encoders.
//!
//! An encoder mutably borrows its [`CommandBuffer`], so a second encoder
//! cannot be opened while one is live, and [`end`](ComputeEncoder::end)
//! consumes it, so nothing can be encoded after it ends:
//!
//! ```compile_fail
//! # use pixlane_gpu::{Backend, Device};
//! let device = Device::new(Backend::Cpu).unwrap();
//! let queue = device.new_command_queue().unwrap();
//! let mut cmd = queue.new_command_buffer().unwrap();
//! let first = cmd.compute_encoder();
//! let second = cmd.blit_encoder(); // first encoder still open
//! first.end();
//! second.end();
//! ```
//!
//! ```compile_fail
//! # use pixlane_gpu::{Backend, Device};
//! let device = Device::new(Backend::Cpu).unwrap();
//! let queue = device.new_command_queue().unwrap();
//! let mut cmd = queue.new_command_buffer().unwrap();
//! let enc = cmd.compute_encoder();
//! enc.end();
//! enc.end(); // already ended
//! ```
//!
//! Remaining misuse is caught at record time and panics: dropping an
//! encoder without `end()`, dispatching without a pipeline or with a
//! binding the kernel uses left unset, threadgroup shapes that differ from
//! the kernel's `@workgroup_size`, writable bindings of read-only
//! resources, misaligned or out-of-range blits, and resources from another
//! device.

use std::collections::BTreeMap;
use std::sync::Arc;

use pixlane_core::{DispatchSize, ThreadgroupSize};
use tracing::trace;

use crate::command::CommandBuffer;
use crate::library::{BindingInfo, BindingKind, ComputePipeline, RenderPipeline};
use crate::resource::DeviceId;
use crate::{Buffer, StorageMode, Texture};

/// Geometric primitive for draw calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveType {
    Point,
    Line,
    LineStrip,
    #[default]
    Triangle,
    TriangleStrip,
}

/// Element type of an index buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub const fn size(&self) -> usize {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// What happens to the render target when a render pass begins.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum LoadAction {
    /// Keep existing contents.
    #[default]
    Load,
    /// Clear to an RGBA colour.
    Clear([f64; 4]),
}

/// Colour attachment of a render pass.
#[derive(Debug, Clone)]
pub struct RenderTarget {
    pub texture: Texture,
    pub load: LoadAction,
}

impl RenderTarget {
    pub fn new(texture: &Texture, load: LoadAction) -> Self {
        Self { texture: texture.clone(), load }
    }
}

// =============================================================================
// Recorded commands
// =============================================================================

#[derive(Debug, Clone)]
pub(crate) enum BoundBuffer {
    Buffer { buffer: Buffer, offset: usize },
    Bytes(Arc<[u8]>),
}

/// Resources bound at the time of a dispatch or draw, keyed by slot.
#[derive(Debug, Clone, Default)]
pub(crate) struct Bindings {
    pub buffers: BTreeMap<u32, BoundBuffer>,
    pub textures: BTreeMap<u32, Texture>,
}

impl Bindings {
    fn bind_buffer(&mut self, device: DeviceId, index: u32, buffer: &Buffer, offset: usize) {
        assert_eq!(buffer.device_id(), device, "buffer at slot {index} belongs to another device");
        assert!(
            offset < buffer.len(),
            "offset {offset} out of range for buffer of {} bytes at slot {index}",
            buffer.len()
        );
        self.buffers.insert(index, BoundBuffer::Buffer { buffer: buffer.clone(), offset });
    }

    fn bind_bytes(&mut self, index: u32, bytes: &[u8]) {
        assert!(!bytes.is_empty(), "inline bytes at slot {index} are empty");
        self.buffers.insert(index, BoundBuffer::Bytes(Arc::from(bytes)));
    }

    fn bind_texture(&mut self, device: DeviceId, index: u32, texture: &Texture) {
        assert_eq!(texture.device_id(), device, "texture at slot {index} belongs to another device");
        self.textures.insert(index, texture.clone());
    }

    /// Captures the bindings `used` by a kernel, panicking on gaps and
    /// usage mismatches.
    fn snapshot(&self, function: &str, used: &[BindingInfo]) -> Bindings {
        let mut out = Bindings::default();
        for binding in used {
            let slot = binding.slot;
            match binding.kind {
                BindingKind::SampledTexture | BindingKind::StorageTexture { .. } => {
                    let texture = self
                        .textures
                        .get(&slot)
                        .unwrap_or_else(|| panic!("`{function}` uses texture slot {slot}, which is not bound"));
                    if matches!(binding.kind, BindingKind::StorageTexture { .. }) {
                        assert!(
                            texture.is_writable(),
                            "`{function}` writes texture slot {slot}, but the bound texture is not writable"
                        );
                    }
                    out.textures.insert(slot, texture.clone());
                }
                BindingKind::StorageBuffer { .. } | BindingKind::UniformBuffer => {
                    let bound = self
                        .buffers
                        .get(&slot)
                        .unwrap_or_else(|| panic!("`{function}` uses buffer slot {slot}, which is not bound"));
                    if binding.kind.is_writable() {
                        assert!(
                            matches!(bound, BoundBuffer::Buffer { .. }),
                            "`{function}` writes buffer slot {slot}, which holds inline bytes"
                        );
                    }
                    out.buffers.insert(slot, bound.clone());
                }
            }
        }
        out
    }
}

#[derive(Debug)]
pub(crate) struct Dispatch {
    pub pipeline: ComputePipeline,
    pub bindings: Bindings,
    pub grid: DispatchSize,
    pub group: ThreadgroupSize,
}

#[derive(Debug)]
pub(crate) enum DrawKind {
    Array { start: u32, count: u32 },
    Indexed { count: u32, index_type: IndexType, buffer: Buffer, offset: usize },
}

#[derive(Debug)]
pub(crate) struct Draw {
    pub pipeline: RenderPipeline,
    pub bindings: Bindings,
    pub kind: DrawKind,
}

#[derive(Debug)]
pub(crate) struct RenderPass {
    pub target: RenderTarget,
    pub draws: Vec<Draw>,
}

#[derive(Debug)]
pub(crate) enum BlitCommand {
    CopyBuffer { src: Buffer, src_offset: usize, dst: Buffer, dst_offset: usize, size: usize },
    Synchronize(Buffer),
}

/// One encoder's worth of recorded work.
#[derive(Debug)]
pub(crate) enum Pass {
    Compute(Vec<Dispatch>),
    Render(RenderPass),
    Blit(Vec<BlitCommand>),
}

fn panic_unended(kind: &str) {
    if !std::thread::panicking() {
        panic!("{kind} encoder dropped without end()");
    }
}

// =============================================================================
// ComputeEncoder
// =============================================================================

/// Records compute dispatches.
#[must_use = "encoders must be ended with end()"]
pub struct ComputeEncoder<'a> {
    cmd: &'a mut CommandBuffer,
    device: DeviceId,
    pipeline: Option<ComputePipeline>,
    bindings: Bindings,
    dispatches: Vec<Dispatch>,
    ended: bool,
}

impl<'a> ComputeEncoder<'a> {
    pub(crate) fn new(cmd: &'a mut CommandBuffer, device: DeviceId) -> Self {
        Self { cmd, device, pipeline: None, bindings: Bindings::default(), dispatches: Vec::new(), ended: false }
    }

    pub fn set_pipeline(&mut self, pipeline: &ComputePipeline) {
        assert_eq!(pipeline.device_id(), self.device, "pipeline belongs to another device");
        self.pipeline = Some(pipeline.clone());
    }

    /// Binds `buffer` from `offset` to the end at buffer slot `index`.
    pub fn set_buffer(&mut self, index: u32, buffer: &Buffer, offset: usize) {
        self.bindings.bind_buffer(self.device, index, buffer, offset);
    }

    /// Binds a copy of `bytes` at buffer slot `index` (uniform or read-only storage).
    pub fn set_bytes(&mut self, index: u32, bytes: &[u8]) {
        self.bindings.bind_bytes(index, bytes);
    }

    pub fn set_texture(&mut self, index: u32, texture: &Texture) {
        self.bindings.bind_texture(self.device, index, texture);
    }

    /// Dispatches `grid` threadgroups of shape `group`.
    ///
    /// # Panics
    ///
    /// If no pipeline is set, `group` differs from the kernel's declared
    /// `@workgroup_size`, or a binding the kernel uses is missing.
    pub fn dispatch(&mut self, grid: DispatchSize, group: ThreadgroupSize) {
        let Some(pipeline) = self.pipeline.as_ref() else {
            panic!("dispatch without a compute pipeline");
        };
        assert_eq!(
            group,
            pipeline.threadgroup_size(),
            "threadgroup size does not match @workgroup_size of `{}`",
            pipeline.name()
        );
        let bindings = self.bindings.snapshot(pipeline.name(), pipeline.bindings());
        trace!(kernel = pipeline.name(), ?grid, ?group, "dispatch");
        self.dispatches.push(Dispatch { pipeline: pipeline.clone(), bindings, grid, group });
    }

    /// Dispatches enough threadgroups to cover `width x height` threads.
    pub fn dispatch_threads(&mut self, width: u32, height: u32, group: ThreadgroupSize) {
        self.dispatch(DispatchSize::covering(width, height, group), group);
    }

    /// Closes the encoder and appends its work to the command buffer.
    pub fn end(mut self) {
        self.ended = true;
        let dispatches = std::mem::take(&mut self.dispatches);
        self.cmd.push_pass(Pass::Compute(dispatches));
    }
}

impl Drop for ComputeEncoder<'_> {
    fn drop(&mut self) {
        if !self.ended {
            panic_unended("compute");
        }
    }
}

// =============================================================================
// RenderEncoder
// =============================================================================

/// Records draws into one colour target.
///
/// Vertex data is fetched by the vertex shader from bound buffers
/// (`@builtin(vertex_index)`), so vertex buffers share the buffer slots.
#[must_use = "encoders must be ended with end()"]
pub struct RenderEncoder<'a> {
    cmd: &'a mut CommandBuffer,
    device: DeviceId,
    target: RenderTarget,
    pipeline: Option<RenderPipeline>,
    bindings: Bindings,
    draws: Vec<Draw>,
    ended: bool,
}

impl<'a> RenderEncoder<'a> {
    pub(crate) fn new(cmd: &'a mut CommandBuffer, device: DeviceId, target: RenderTarget) -> Self {
        Self { cmd, device, target, pipeline: None, bindings: Bindings::default(), draws: Vec::new(), ended: false }
    }

    pub fn set_pipeline(&mut self, pipeline: &RenderPipeline) {
        assert_eq!(pipeline.device_id(), self.device, "pipeline belongs to another device");
        assert_eq!(
            pipeline.color_format(),
            self.target.texture.format(),
            "render pipeline colour format does not match the target"
        );
        self.pipeline = Some(pipeline.clone());
    }

    /// Binds vertex data at buffer slot `index`. Same as [`set_buffer`](Self::set_buffer).
    pub fn set_vertex_buffer(&mut self, index: u32, buffer: &Buffer, offset: usize) {
        self.set_buffer(index, buffer, offset);
    }

    pub fn set_buffer(&mut self, index: u32, buffer: &Buffer, offset: usize) {
        self.bindings.bind_buffer(self.device, index, buffer, offset);
    }

    pub fn set_bytes(&mut self, index: u32, bytes: &[u8]) {
        self.bindings.bind_bytes(index, bytes);
    }

    pub fn set_texture(&mut self, index: u32, texture: &Texture) {
        self.bindings.bind_texture(self.device, index, texture);
    }

    fn bound_pipeline(&self, primitive: PrimitiveType) -> &RenderPipeline {
        let Some(pipeline) = self.pipeline.as_ref() else {
            panic!("draw without a render pipeline");
        };
        assert_eq!(pipeline.primitive(), primitive, "primitive does not match the pipeline topology");
        pipeline
    }

    /// Draws `count` vertices starting at `start`.
    pub fn draw(&mut self, primitive: PrimitiveType, start: u32, count: u32) {
        let pipeline = self.bound_pipeline(primitive).clone();
        let bindings = self.bindings.snapshot(pipeline.name(), pipeline.bindings());
        self.draws.push(Draw { pipeline, bindings, kind: DrawKind::Array { start, count } });
    }

    /// Draws `index_count` indices read from `index_buffer` at `index_offset`.
    pub fn draw_indexed(
        &mut self,
        primitive: PrimitiveType,
        index_count: u32,
        index_type: IndexType,
        index_buffer: &Buffer,
        index_offset: usize,
    ) {
        assert_eq!(index_buffer.device_id(), self.device, "index buffer belongs to another device");
        let end = (index_count as usize)
            .checked_mul(index_type.size())
            .and_then(|bytes| fits(index_offset, bytes, index_buffer.len()));
        assert!(end.is_some(), "index range exceeds index buffer");
        assert_eq!(index_offset % index_type.size(), 0, "index offset is not aligned to the index size");
        let pipeline = self.bound_pipeline(primitive).clone();
        let bindings = self.bindings.snapshot(pipeline.name(), pipeline.bindings());
        self.draws.push(Draw {
            pipeline,
            bindings,
            kind: DrawKind::Indexed { count: index_count, index_type, buffer: index_buffer.clone(), offset: index_offset },
        });
    }

    pub fn end(mut self) {
        self.ended = true;
        let pass = RenderPass { target: self.target.clone(), draws: std::mem::take(&mut self.draws) };
        self.cmd.push_pass(Pass::Render(pass));
    }
}

/// End of `offset..offset + size` when it lies within `len` bytes.
fn fits(offset: usize, size: usize, len: usize) -> Option<usize> {
    offset.checked_add(size).filter(|end| *end <= len)
}

impl Drop for RenderEncoder<'_> {
    fn drop(&mut self) {
        if !self.ended {
            panic_unended("render");
        }
    }
}

// =============================================================================
// BlitEncoder
// =============================================================================

/// Records buffer copies and managed-buffer synchronisation.
#[must_use = "encoders must be ended with end()"]
pub struct BlitEncoder<'a> {
    cmd: &'a mut CommandBuffer,
    device: DeviceId,
    commands: Vec<BlitCommand>,
    ended: bool,
}

impl<'a> BlitEncoder<'a> {
    pub(crate) fn new(cmd: &'a mut CommandBuffer, device: DeviceId) -> Self {
        Self { cmd, device, commands: Vec::new(), ended: false }
    }

    /// Copies `size` bytes between two distinct buffers.
    ///
    /// # Panics
    ///
    /// If offsets or size are not multiples of 4, a range exceeds its
    /// buffer, or `src` and `dst` are the same buffer.
    pub fn copy_buffer(&mut self, src: &Buffer, src_offset: usize, dst: &Buffer, dst_offset: usize, size: usize) {
        assert_eq!(src.device_id(), self.device, "copy source belongs to another device");
        assert_eq!(dst.device_id(), self.device, "copy destination belongs to another device");
        assert!(!src.ptr_eq(dst), "copy source and destination are the same buffer");
        assert!(
            src_offset % 4 == 0 && dst_offset % 4 == 0 && size % 4 == 0,
            "buffer copies need 4-byte aligned offsets and size"
        );
        assert!(fits(src_offset, size, src.len()).is_some(), "copy source range exceeds buffer");
        assert!(fits(dst_offset, size, dst.len()).is_some(), "copy destination range exceeds buffer");
        if size > 0 {
            self.commands.push(BlitCommand::CopyBuffer {
                src: src.clone(),
                src_offset,
                dst: dst.clone(),
                dst_offset,
                size,
            });
        }
    }

    /// Makes device writes to a managed buffer visible to
    /// [`Buffer::contents`] once the command buffer completes. No-op for
    /// other storage modes.
    pub fn synchronize(&mut self, buffer: &Buffer) {
        assert_eq!(buffer.device_id(), self.device, "buffer belongs to another device");
        if buffer.storage_mode() == StorageMode::Managed {
            self.commands.push(BlitCommand::Synchronize(buffer.clone()));
        }
    }

    pub fn end(mut self) {
        self.ended = true;
        let commands = std::mem::take(&mut self.commands);
        self.cmd.push_pass(Pass::Blit(commands));
    }
}

impl Drop for BlitEncoder<'_> {
    fn drop(&mut self) {
        if !self.ended {
            panic_unended("blit");
        }
    }
}
