//! wgpu backend implementation.
//!
//! `NativeGpu` opens adapters of the primary API set (Vulkan / Metal /
//! DX12), `AlternateGpu` those of the secondary set (OpenGL / GLES). Only
//! adapters with compute shader support are considered.
//!
//! Command buffers are translated to one wgpu command encoder at commit and
//! submitted on the caller's thread. Each queue owns a poller thread that
//! waits for submissions in order, finishes managed-buffer readbacks and
//! runs the completion protocol.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use pixlane_core::TextureFormat;
use tracing::{debug, trace, warn};
use wgpu::util::DeviceExt;

use super::Backend;
use crate::buffer::{BufferView, StorageMode, ViewRepr};
use crate::command::Submission;
use crate::config::{ContextConfig, PowerPreference, gpu_memory_override};
use crate::device::{DeviceInfo, DeviceType};
use crate::encoder::{Bindings, BlitCommand, BoundBuffer, DrawKind, IndexType, LoadAction, Pass, PrimitiveType, RenderPass};
use crate::library::{
    BindingInfo, BindingKind, BUFFER_GROUP, Function, RawLibrary, RawRenderPipeline, RenderPipelineDescriptor,
    TEXTURE_GROUP,
};
use crate::{Buffer, ComputeError, ComputeResult};

const ALL_FORMATS: [TextureFormat; 5] = [
    TextureFormat::Rgba8Unorm,
    TextureFormat::Bgra8Unorm,
    TextureFormat::Rgba16Float,
    TextureFormat::Rgba32Float,
    TextureFormat::R32Float,
];

fn wgpu_backends(backend: Backend) -> wgpu::Backends {
    match backend {
        Backend::NativeGpu => wgpu::Backends::PRIMARY,
        Backend::AlternateGpu => wgpu::Backends::SECONDARY,
        Backend::Auto => wgpu::Backends::all(),
        Backend::Cpu => wgpu::Backends::empty(),
    }
}

fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
    }
}

fn format_index(format: TextureFormat) -> usize {
    ALL_FORMATS.iter().position(|f| *f == format).unwrap_or(0)
}

fn padded(len: usize) -> u64 {
    len.div_ceil(4) as u64 * 4
}

// =============================================================================
// Adapter discovery
// =============================================================================

fn supports_compute(adapter: &wgpu::Adapter) -> bool {
    adapter
        .get_downlevel_capabilities()
        .flags
        .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
}

fn preference_rank(device_type: wgpu::DeviceType, power: PowerPreference) -> u8 {
    use wgpu::DeviceType::*;
    match (power, device_type) {
        (PowerPreference::HighPerformance, DiscreteGpu) | (PowerPreference::LowPower, IntegratedGpu) => 0,
        (PowerPreference::HighPerformance, IntegratedGpu) | (PowerPreference::LowPower, DiscreteGpu) => 1,
        (_, VirtualGpu) => 2,
        (_, Other) => 3,
        (_, Cpu) => 4,
    }
}

/// Compute-capable adapters of `backend`, most preferred first.
fn adapters(backend: Backend, power: PowerPreference) -> Vec<wgpu::Adapter> {
    let backends = wgpu_backends(backend);
    if backends.is_empty() {
        return Vec::new();
    }
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor { backends, ..Default::default() });
    let mut list: Vec<_> = instance
        .enumerate_adapters(backends)
        .into_iter()
        .filter(supports_compute)
        .collect();
    list.sort_by_key(|a| preference_rank(a.get_info().device_type, power));
    list
}

pub(crate) fn is_available(backend: Backend) -> bool {
    !adapters(backend, PowerPreference::default()).is_empty()
}

pub(crate) fn enumerate(backend: Backend) -> Vec<DeviceInfo> {
    adapters(backend, PowerPreference::default())
        .iter()
        .map(|a| adapter_info(a, backend))
        .collect()
}

fn adapter_info(adapter: &wgpu::Adapter, backend: Backend) -> DeviceInfo {
    let info = adapter.get_info();
    let limits = adapter.limits();
    let device_type = match info.device_type {
        wgpu::DeviceType::DiscreteGpu => DeviceType::Discrete,
        wgpu::DeviceType::IntegratedGpu => DeviceType::Integrated,
        wgpu::DeviceType::VirtualGpu => DeviceType::Virtual,
        wgpu::DeviceType::Cpu => DeviceType::Cpu,
        wgpu::DeviceType::Other => DeviceType::Other,
    };
    DeviceInfo {
        name: format!("{} ({:?})", info.name, info.backend),
        backend,
        device_type,
        unified_memory: matches!(device_type, DeviceType::Integrated | DeviceType::Cpu),
        max_buffer_size: limits.max_buffer_size,
        max_texture_dimension: limits.max_texture_dimension_2d,
        memory_bytes: estimate_vram(&info, limits.max_buffer_size),
    }
}

/// wgpu does not expose VRAM size; estimate from the buffer limit.
fn estimate_vram(info: &wgpu::AdapterInfo, max_buffer_bytes: u64) -> u64 {
    if let Some(bytes) = gpu_memory_override() {
        return bytes;
    }

    let from_buffer = max_buffer_bytes.saturating_mul(2);

    match info.device_type {
        wgpu::DeviceType::DiscreteGpu => from_buffer.clamp(2u64 << 30, 24u64 << 30),
        wgpu::DeviceType::IntegratedGpu => from_buffer.clamp(512u64 << 20, 4u64 << 30),
        wgpu::DeviceType::VirtualGpu => from_buffer.clamp(1u64 << 30, 8u64 << 30),
        _ => from_buffer.clamp(256u64 << 20, 2u64 << 30),
    }
}

// =============================================================================
// Device
// =============================================================================

/// State shared by a device and every object it creates.
pub(crate) struct WgpuShared {
    device: wgpu::Device,
    queue: wgpu::Queue,
    /// Serialises error scopes, which are per device.
    scope_lock: Mutex<()>,
    /// Shared buffers are host-mappable (unified memory).
    mappable: bool,
    renderable: [bool; 5],
    storable: [bool; 5],
}

impl WgpuShared {
    /// Runs `make` inside validation and out-of-memory error scopes.
    fn scoped<T>(&self, make: impl FnOnce() -> T) -> Result<T, String> {
        let _guard = self.scope_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = make();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        match validation.or(oom) {
            Some(err) => Err(err.to_string()),
            None => Ok(value),
        }
    }

    /// Submits queued `write_buffer` / `write_texture` calls.
    fn flush_writes(&self) {
        self.queue.submit(std::iter::empty());
    }

    /// Maps `slice` and blocks until the mapping is ready.
    fn map_blocking(&self, slice: wgpu::BufferSlice<'_>, mode: wgpu::MapMode) -> ComputeResult<()> {
        let (tx, rx) = mpsc::channel();
        slice.map_async(mode, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| ComputeError::Execution("buffer mapping was abandoned".into()))?
            .map_err(|e| ComputeError::Execution(format!("buffer mapping failed: {e}")))
    }

    /// Copies `size` bytes of `buffer` into host memory through a staging buffer.
    fn read_back(&self, buffer: &wgpu::Buffer, size: u64) -> ComputeResult<Vec<u8>> {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pixlane_readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("pixlane_readback"),
        });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));
        self.map_blocking(staging.slice(..), wgpu::MapMode::Read)?;
        let bytes = staging.slice(..).get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }
}

pub(crate) struct WgpuDevice {
    shared: Arc<WgpuShared>,
    info: DeviceInfo,
}

impl WgpuDevice {
    /// Opens the preferred adapter of `backend`, or the `index`-th one.
    pub(crate) fn open(backend: Backend, config: &ContextConfig, index: Option<usize>) -> ComputeResult<Self> {
        let list = adapters(backend, config.power);
        let adapter = match index {
            Some(i) => list.into_iter().nth(i),
            None => list.into_iter().next(),
        }
        .ok_or(ComputeError::DeviceNotFound)?;
        let info = adapter_info(&adapter, backend);

        let available = adapter.features();
        let mut required = wgpu::Features::empty();
        let mappable = info.unified_memory && available.contains(wgpu::Features::MAPPABLE_PRIMARY_BUFFERS);
        if mappable {
            required |= wgpu::Features::MAPPABLE_PRIMARY_BUFFERS;
        }
        let bgra_storage = available.contains(wgpu::Features::BGRA8UNORM_STORAGE);
        if bgra_storage {
            required |= wgpu::Features::BGRA8UNORM_STORAGE;
        }

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some(&config.label),
                required_features: required,
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| ComputeError::BackendNotAvailable(format!("{backend}: {e}")))?;

        device.on_uncaptured_error(Box::new(|error| {
            warn!(%error, "uncaptured wgpu error");
        }));

        let mut renderable = [false; 5];
        let mut storable = [false; 5];
        for (i, format) in ALL_FORMATS.iter().enumerate() {
            let usages = adapter.get_texture_format_features(texture_format(*format)).allowed_usages;
            renderable[i] = usages.contains(wgpu::TextureUsages::RENDER_ATTACHMENT);
            storable[i] = usages.contains(wgpu::TextureUsages::STORAGE_BINDING)
                && (*format != TextureFormat::Bgra8Unorm || bgra_storage);
        }

        debug!(name = %info.name, mappable, bgra_storage, "opened wgpu device");
        Ok(Self {
            shared: Arc::new(WgpuShared {
                device,
                queue,
                scope_lock: Mutex::new(()),
                mappable,
                renderable,
                storable,
            }),
            info,
        })
    }

    pub(crate) fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub(crate) fn new_queue(&self, label: &str) -> ComputeResult<WgpuQueue> {
        WgpuQueue::spawn(Arc::clone(&self.shared), label)
    }

    pub(crate) fn create_shader_module(&self, source: &str) -> ComputeResult<wgpu::ShaderModule> {
        self.shared
            .scoped(|| {
                self.shared.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("pixlane_library"),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                })
            })
            .map_err(ComputeError::LibraryCreation)
    }

    pub(crate) fn new_buffer(&self, len: usize, mode: StorageMode) -> ComputeResult<WgpuBuffer> {
        use wgpu::BufferUsages as U;
        let mapped = mode == StorageMode::Shared && self.shared.mappable;
        let mut usage = U::STORAGE | U::UNIFORM | U::COPY_SRC | U::COPY_DST | U::INDEX | U::VERTEX;
        if mapped {
            usage |= U::MAP_READ | U::MAP_WRITE;
        }
        let buffer = self
            .shared
            .scoped(|| {
                self.shared.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("pixlane_buffer"),
                    size: padded(len),
                    usage,
                    mapped_at_creation: false,
                })
            })
            .map_err(ComputeError::BufferCreation)?;
        let shadow = (mode == StorageMode::Managed).then(|| Mutex::new(vec![0u8; len]));
        Ok(WgpuBuffer { shared: Arc::clone(&self.shared), buffer, len, mode, mapped, shadow })
    }

    /// Returns the texture and whether it can be a render target.
    pub(crate) fn new_texture(
        &self,
        width: u32,
        height: u32,
        format: TextureFormat,
        writable: bool,
    ) -> ComputeResult<(WgpuTexture, bool)> {
        let slot = format_index(format);
        if writable && !self.shared.storable[slot] {
            return Err(ComputeError::NotImplemented { backend: "wgpu", operation: "writable textures of this format" });
        }
        let renderable = self.shared.renderable[slot];

        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;
        if renderable {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        if writable {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }

        let texture = self
            .shared
            .scoped(|| {
                self.shared.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("pixlane_texture"),
                    size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: texture_format(format),
                    usage,
                    view_formats: &[],
                })
            })
            .map_err(ComputeError::TextureCreation)?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok((
            WgpuTexture { shared: Arc::clone(&self.shared), texture, view, format, width, height },
            renderable,
        ))
    }

    fn bind_group_layouts(
        &self,
        bindings: &[BindingInfo],
        visibility: wgpu::ShaderStages,
    ) -> [wgpu::BindGroupLayout; 2] {
        [BUFFER_GROUP, TEXTURE_GROUP].map(|group| {
            let entries: Vec<_> = bindings
                .iter()
                .filter(|b| b.group == group)
                .map(|b| wgpu::BindGroupLayoutEntry {
                    binding: b.slot,
                    visibility,
                    ty: binding_type(b.kind),
                    count: None,
                })
                .collect();
            self.shared.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("pixlane_bind_group_layout"),
                entries: &entries,
            })
        })
    }

    fn module<'a>(&self, function: &'a Function) -> ComputeResult<&'a wgpu::ShaderModule> {
        match function.library().raw() {
            RawLibrary::Wgpu(module) => Ok(module),
            RawLibrary::Cpu => Err(ComputeError::PipelineCreation(format!(
                "`{}` was not compiled for a GPU device",
                function.name()
            ))),
        }
    }

    pub(crate) fn make_compute_pipeline(&self, function: &Function) -> ComputeResult<WgpuComputePipeline> {
        let module = self.module(function)?;
        let device = &self.shared.device;
        self.shared
            .scoped(|| {
                let layouts = self.bind_group_layouts(function.bindings(), wgpu::ShaderStages::COMPUTE);
                let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(function.name()),
                    bind_group_layouts: &[&layouts[0], &layouts[1]],
                    push_constant_ranges: &[],
                });
                let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(function.name()),
                    layout: Some(&layout),
                    module,
                    entry_point: Some(function.name()),
                    compilation_options: Default::default(),
                    cache: None,
                });
                WgpuComputePipeline { pipeline, layouts }
            })
            .map_err(ComputeError::PipelineCreation)
    }

    pub(crate) fn make_render_pipeline(
        &self,
        descriptor: &RenderPipelineDescriptor,
        bindings: &[BindingInfo],
    ) -> ComputeResult<WgpuRenderPipeline> {
        let vertex = self.module(&descriptor.vertex)?;
        let fragment = self.module(&descriptor.fragment)?;
        let device = &self.shared.device;
        let label = descriptor.label.as_deref().unwrap_or_else(|| descriptor.vertex.name());
        let topology = match descriptor.primitive {
            PrimitiveType::Point => wgpu::PrimitiveTopology::PointList,
            PrimitiveType::Line => wgpu::PrimitiveTopology::LineList,
            PrimitiveType::LineStrip => wgpu::PrimitiveTopology::LineStrip,
            PrimitiveType::Triangle => wgpu::PrimitiveTopology::TriangleList,
            PrimitiveType::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        };

        self.shared
            .scoped(|| {
                let layouts = self.bind_group_layouts(bindings, wgpu::ShaderStages::VERTEX_FRAGMENT);
                let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(label),
                    bind_group_layouts: &[&layouts[0], &layouts[1]],
                    push_constant_ranges: &[],
                });
                let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(label),
                    layout: Some(&layout),
                    vertex: wgpu::VertexState {
                        module: vertex,
                        entry_point: Some(descriptor.vertex.name()),
                        compilation_options: Default::default(),
                        buffers: &[],
                    },
                    primitive: wgpu::PrimitiveState { topology, ..Default::default() },
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    fragment: Some(wgpu::FragmentState {
                        module: fragment,
                        entry_point: Some(descriptor.fragment.name()),
                        compilation_options: Default::default(),
                        targets: &[Some(wgpu::ColorTargetState {
                            format: texture_format(descriptor.color_format),
                            blend: None,
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                    }),
                    multiview: None,
                    cache: None,
                });
                WgpuRenderPipeline { pipeline, layouts }
            })
            .map_err(ComputeError::PipelineCreation)
    }
}

fn binding_type(kind: BindingKind) -> wgpu::BindingType {
    match kind {
        BindingKind::StorageBuffer { read_only } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::UniformBuffer => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::SampledTexture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        BindingKind::StorageTexture { format } => wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: texture_format(format),
            view_dimension: wgpu::TextureViewDimension::D2,
        },
    }
}

pub(crate) struct WgpuComputePipeline {
    pipeline: wgpu::ComputePipeline,
    layouts: [wgpu::BindGroupLayout; 2],
}

pub(crate) struct WgpuRenderPipeline {
    pipeline: wgpu::RenderPipeline,
    layouts: [wgpu::BindGroupLayout; 2],
}

// =============================================================================
// Buffers
// =============================================================================

pub(crate) struct WgpuBuffer {
    shared: Arc<WgpuShared>,
    buffer: wgpu::Buffer,
    len: usize,
    mode: StorageMode,
    /// Host-mappable: shared views are zero-copy.
    mapped: bool,
    /// Host copy of a managed buffer.
    shadow: Option<Mutex<Vec<u8>>>,
}

impl WgpuBuffer {
    fn shadow(&self) -> Option<MutexGuard<'_, Vec<u8>>> {
        self.shadow.as_ref().map(|s| s.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Queues a device write of `bytes` at a 4-aligned `offset`, zero
    /// padding a short tail.
    fn write_device(&self, offset: usize, bytes: &[u8]) {
        if bytes.len() % 4 == 0 {
            self.shared.queue.write_buffer(&self.buffer, offset as u64, bytes);
        } else {
            let mut tail = bytes.to_vec();
            tail.resize(padded(bytes.len()) as usize, 0);
            self.shared.queue.write_buffer(&self.buffer, offset as u64, &tail);
        }
        self.shared.flush_writes();
    }

    pub(crate) fn upload(&self, offset: usize, bytes: &[u8]) -> ComputeResult<()> {
        if let Some(mut shadow) = self.shadow() {
            shadow[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        self.write_device(offset, bytes);
        Ok(())
    }

    pub(crate) fn write_contents(&self, offset: usize, bytes: &[u8]) -> ComputeResult<()> {
        match self.shadow() {
            Some(mut shadow) => shadow[offset..offset + bytes.len()].copy_from_slice(bytes),
            None => self.write_device(offset, bytes),
        }
        Ok(())
    }

    pub(crate) fn contents(&self, len: usize) -> ComputeResult<BufferView<'_>> {
        if let Some(guard) = self.shadow() {
            return Ok(BufferView::new(ViewRepr::Shadow { guard, len }));
        }
        self.download(len)
    }

    pub(crate) fn download(&self, len: usize) -> ComputeResult<BufferView<'_>> {
        if self.mapped && self.mode == StorageMode::Shared {
            let slice = self.buffer.slice(..);
            self.shared.map_blocking(slice, wgpu::MapMode::Read)?;
            let view = slice.get_mapped_range();
            return Ok(BufferView::new(ViewRepr::Mapped(MappedView { buffer: &self.buffer, view: Some(view), len })));
        }
        let mut bytes = self.shared.read_back(&self.buffer, padded(len))?;
        bytes.truncate(len);
        Ok(BufferView::owned(bytes))
    }

    /// Pushes `range` of the host copy to the device, widened to words.
    pub(crate) fn flush_shadow(&self, range: std::ops::Range<usize>) -> ComputeResult<()> {
        let Some(shadow) = self.shadow() else { return Ok(()) };
        let start = range.start & !3;
        let end = range.end.next_multiple_of(4).min(self.len);
        if start >= end {
            return Ok(());
        }
        let bytes = shadow[start..end].to_vec();
        drop(shadow);
        self.write_device(start, &bytes);
        Ok(())
    }
}

/// Host mapping of a shared buffer. Unmaps on drop.
pub(crate) struct MappedView<'a> {
    buffer: &'a wgpu::Buffer,
    view: Option<wgpu::BufferView<'a>>,
    len: usize,
}

impl MappedView<'_> {
    pub(crate) fn bytes(&self) -> &[u8] {
        match &self.view {
            Some(view) => &view[..self.len],
            None => &[],
        }
    }
}

impl Drop for MappedView<'_> {
    fn drop(&mut self) {
        self.view.take();
        self.buffer.unmap();
    }
}

// =============================================================================
// Textures
// =============================================================================

pub(crate) struct WgpuTexture {
    shared: Arc<WgpuShared>,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: TextureFormat,
    width: u32,
    height: u32,
}

impl WgpuTexture {
    fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d { width: self.width, height: self.height, depth_or_array_layers: 1 }
    }

    pub(crate) fn upload(&self, bytes: &[u8], bytes_per_row: usize) -> ComputeResult<()> {
        self.shared.queue.write_texture(
            self.texture.as_image_copy(),
            bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row as u32),
                rows_per_image: Some(self.height),
            },
            self.extent(),
        );
        self.shared.flush_writes();
        Ok(())
    }

    pub(crate) fn download(&self, bytes_per_row: usize) -> ComputeResult<Vec<u8>> {
        let row_bytes = self.format.row_bytes(self.width);
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize;
        let pitch = row_bytes.div_ceil(align) * align;
        let size = (pitch * self.height as usize) as u64;

        let staging = self.shared.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pixlane_texture_readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.shared.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("pixlane_texture_readback"),
        });
        encoder.copy_texture_to_buffer(
            self.texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(pitch as u32),
                    rows_per_image: Some(self.height),
                },
            },
            self.extent(),
        );
        self.shared.queue.submit(Some(encoder.finish()));
        self.shared.map_blocking(staging.slice(..), wgpu::MapMode::Read)?;

        let mut out = vec![0u8; bytes_per_row * self.height as usize];
        {
            let mapped = staging.slice(..).get_mapped_range();
            for (dst, src) in out.chunks_exact_mut(bytes_per_row).zip(mapped.chunks_exact(pitch)) {
                dst[..row_bytes].copy_from_slice(&src[..row_bytes]);
            }
        }
        staging.unmap();
        Ok(out)
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Staging copy of a managed buffer, applied to its host copy on completion.
struct Readback {
    target: Buffer,
    staging: wgpu::Buffer,
}

struct InFlight {
    outcome: Result<(wgpu::SubmissionIndex, Vec<Readback>), String>,
    passes: Vec<Pass>,
    temps: Vec<wgpu::Buffer>,
    finisher: crate::command::Finisher,
}

pub(crate) struct WgpuQueue {
    shared: Arc<WgpuShared>,
    label: String,
    sender: Mutex<Option<Sender<InFlight>>>,
    poller: Option<JoinHandle<()>>,
    poller_id: ThreadId,
}

impl WgpuQueue {
    fn spawn(shared: Arc<WgpuShared>, label: &str) -> ComputeResult<Self> {
        let (sender, receiver) = mpsc::channel::<InFlight>();
        let poller_shared = Arc::clone(&shared);
        let poller = thread::Builder::new()
            .name(format!("{label}-poller"))
            .spawn(move || {
                for job in receiver {
                    complete(&poller_shared, job);
                }
            })
            .map_err(|e| ComputeError::CommandQueueCreation(e.to_string()))?;
        let poller_id = poller.thread().id();
        Ok(Self { shared, label: label.to_string(), sender: Mutex::new(Some(sender)), poller: Some(poller), poller_id })
    }

    pub(crate) fn is_alive(&self) -> bool {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        sender.is_some() && self.poller.as_ref().is_some_and(|p| !p.is_finished())
    }

    pub(crate) fn submit(&self, submission: Submission) {
        let Submission { passes, finisher } = submission;
        let mut temps = Vec::new();
        let outcome = self.encode_and_submit(&passes, &mut temps);
        let job = InFlight { outcome, passes, temps, finisher };

        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = sender.as_ref() {
            // A send error hands the job back; dropping it fails the buffer.
            let _ = sender.send(job);
        }
    }

    fn encode_and_submit(
        &self,
        passes: &[Pass],
        temps: &mut Vec<wgpu::Buffer>,
    ) -> Result<(wgpu::SubmissionIndex, Vec<Readback>), String> {
        let device = &self.shared.device;
        let _guard = self.shared.scope_lock.lock().unwrap_or_else(PoisonError::into_inner);
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let mut readbacks = Vec::new();
        let recorded = self.record(passes, temps, &mut readbacks);
        let error = pollster::block_on(device.pop_error_scope());

        let commands = recorded?;
        if let Some(error) = error {
            return Err(error.to_string());
        }
        let index = self.shared.queue.submit(Some(commands));
        trace!(queue = %self.label, passes = passes.len(), "submitted");
        Ok((index, readbacks))
    }

    fn record(
        &self,
        passes: &[Pass],
        temps: &mut Vec<wgpu::Buffer>,
        readbacks: &mut Vec<Readback>,
    ) -> Result<wgpu::CommandBuffer, String> {
        let device = &self.shared.device;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(&self.label) });

        for pass in passes {
            match pass {
                Pass::Compute(dispatches) => {
                    let mut prepared = Vec::with_capacity(dispatches.len());
                    for dispatch in dispatches {
                        let Some(raw) = dispatch.pipeline.raw().as_wgpu() else {
                            return Err(format!("`{}` is not a GPU pipeline", dispatch.pipeline.name()));
                        };
                        let groups =
                            self.bind_groups(&raw.layouts, &dispatch.bindings, dispatch.pipeline.bindings(), temps)?;
                        prepared.push((&raw.pipeline, groups, dispatch.grid));
                    }
                    let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("pixlane_compute"),
                        timestamp_writes: None,
                    });
                    for (pipeline, groups, grid) in &prepared {
                        if grid.is_empty() {
                            continue;
                        }
                        cpass.set_pipeline(pipeline);
                        cpass.set_bind_group(0, &groups[0], &[]);
                        cpass.set_bind_group(1, &groups[1], &[]);
                        cpass.dispatch_workgroups(grid.x, grid.y, grid.z);
                    }
                }
                Pass::Render(render) => self.record_render(&mut encoder, render, temps)?,
                Pass::Blit(commands) => {
                    for command in commands {
                        match command {
                            BlitCommand::CopyBuffer { src, src_offset, dst, dst_offset, size } => {
                                let (Some(s), Some(d)) = (src.raw().as_wgpu(), dst.raw().as_wgpu()) else {
                                    return Err("copy between buffers of another backend".into());
                                };
                                encoder.copy_buffer_to_buffer(
                                    &s.buffer,
                                    *src_offset as u64,
                                    &d.buffer,
                                    *dst_offset as u64,
                                    *size as u64,
                                );
                            }
                            BlitCommand::Synchronize(buffer) => {
                                let Some(b) = buffer.raw().as_wgpu() else {
                                    return Err("synchronize of a buffer of another backend".into());
                                };
                                let staging = device.create_buffer(&wgpu::BufferDescriptor {
                                    label: Some("pixlane_synchronize"),
                                    size: padded(b.len),
                                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                                    mapped_at_creation: false,
                                });
                                encoder.copy_buffer_to_buffer(&b.buffer, 0, &staging, 0, padded(b.len));
                                readbacks.push(Readback { target: buffer.clone(), staging });
                            }
                        }
                    }
                }
            }
        }
        Ok(encoder.finish())
    }

    fn record_render(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        render: &RenderPass,
        temps: &mut Vec<wgpu::Buffer>,
    ) -> Result<(), String> {
        let Some(target) = render.target.texture.raw().as_wgpu() else {
            return Err("render target of another backend".into());
        };
        let mut prepared = Vec::with_capacity(render.draws.len());
        for draw in &render.draws {
            let RawRenderPipeline::Wgpu(raw) = draw.pipeline.raw();
            let groups = self.bind_groups(&raw.layouts, &draw.bindings, draw.pipeline.bindings(), temps)?;
            prepared.push((&raw.pipeline, groups, &draw.kind));
        }

        let load = match render.target.load {
            LoadAction::Load => wgpu::LoadOp::Load,
            LoadAction::Clear([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
        };
        let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("pixlane_render"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target.view,
                resolve_target: None,
                ops: wgpu::Operations { load, store: wgpu::StoreOp::Store },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        for (pipeline, groups, kind) in &prepared {
            rpass.set_pipeline(pipeline);
            rpass.set_bind_group(0, &groups[0], &[]);
            rpass.set_bind_group(1, &groups[1], &[]);
            match kind {
                DrawKind::Array { start, count } => rpass.draw(*start..start + count, 0..1),
                DrawKind::Indexed { count, index_type, buffer, offset } => {
                    let Some(index) = buffer.raw().as_wgpu() else {
                        return Err("index buffer of another backend".into());
                    };
                    let format = match index_type {
                        IndexType::U16 => wgpu::IndexFormat::Uint16,
                        IndexType::U32 => wgpu::IndexFormat::Uint32,
                    };
                    rpass.set_index_buffer(index.buffer.slice(*offset as u64..), format);
                    rpass.draw_indexed(0..*count, 0, 0..1);
                }
            }
        }
        Ok(())
    }

    /// Builds both bind groups of a dispatch or draw. Inline bytes become
    /// temporary uniform buffers kept alive until completion.
    fn bind_groups(
        &self,
        layouts: &[wgpu::BindGroupLayout; 2],
        bindings: &Bindings,
        used: &[BindingInfo],
        temps: &mut Vec<wgpu::Buffer>,
    ) -> Result<[wgpu::BindGroup; 2], String> {
        let device = &self.shared.device;

        let mut inline: Vec<(u32, wgpu::Buffer)> = Vec::new();
        for info in used.iter().filter(|b| b.group == BUFFER_GROUP) {
            if let Some(BoundBuffer::Bytes(bytes)) = bindings.buffers.get(&info.slot) {
                let mut contents = bytes.to_vec();
                contents.resize(contents.len().div_ceil(16) * 16, 0);
                let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("pixlane_inline_bytes"),
                    contents: &contents,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::STORAGE,
                });
                inline.push((info.slot, buffer));
            }
        }

        let mut buffer_entries = Vec::new();
        let mut texture_entries = Vec::new();
        for info in used {
            if info.group == BUFFER_GROUP {
                let resource = match bindings.buffers.get(&info.slot) {
                    Some(BoundBuffer::Buffer { buffer, offset }) => {
                        let Some(raw) = buffer.raw().as_wgpu() else {
                            return Err(format!("buffer slot {} holds a buffer of another backend", info.slot));
                        };
                        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: &raw.buffer,
                            offset: *offset as u64,
                            size: None,
                        })
                    }
                    Some(BoundBuffer::Bytes(_)) => match inline.iter().find(|(slot, _)| *slot == info.slot) {
                        Some((_, buffer)) => buffer.as_entire_binding(),
                        None => return Err(format!("buffer slot {} lost its inline bytes", info.slot)),
                    },
                    None => return Err(format!("buffer slot {} is not bound", info.slot)),
                };
                buffer_entries.push(wgpu::BindGroupEntry { binding: info.slot, resource });
            } else {
                let Some(texture) = bindings.textures.get(&info.slot) else {
                    return Err(format!("texture slot {} is not bound", info.slot));
                };
                let Some(raw) = texture.raw().as_wgpu() else {
                    return Err(format!("texture slot {} holds a texture of another backend", info.slot));
                };
                texture_entries.push(wgpu::BindGroupEntry {
                    binding: info.slot,
                    resource: wgpu::BindingResource::TextureView(&raw.view),
                });
            }
        }

        let groups = [
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("pixlane_buffers"),
                layout: &layouts[0],
                entries: &buffer_entries,
            }),
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("pixlane_textures"),
                layout: &layouts[1],
                entries: &texture_entries,
            }),
        ];
        drop(buffer_entries);
        temps.extend(inline.into_iter().map(|(_, buffer)| buffer));
        Ok(groups)
    }
}

impl Drop for WgpuQueue {
    fn drop(&mut self) {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(poller) = self.poller.take() {
            if thread::current().id() != self.poller_id {
                let _ = poller.join();
            }
        }
    }
}

/// Waits for one submission, applies its readbacks, then finishes it.
fn complete(shared: &WgpuShared, job: InFlight) {
    let InFlight { outcome, passes, temps, finisher } = job;
    let result = match outcome {
        Ok((index, readbacks)) => {
            shared.device.poll(wgpu::Maintain::wait_for(index));
            readbacks.iter().try_for_each(|r| apply_readback(shared, r)).map_err(|e| e.to_string())
        }
        Err(msg) => Err(msg),
    };
    drop(temps);
    drop(passes);
    finisher.finish(result);
}

fn apply_readback(shared: &WgpuShared, readback: &Readback) -> ComputeResult<()> {
    let Some(raw) = readback.target.raw().as_wgpu() else {
        return Ok(());
    };
    shared.map_blocking(readback.staging.slice(..), wgpu::MapMode::Read)?;
    {
        let mapped = readback.staging.slice(..).get_mapped_range();
        if let Some(mut shadow) = raw.shadow() {
            let len = shadow.len();
            shadow.copy_from_slice(&mapped[..len]);
        }
    }
    readback.staging.unmap();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_ranking() {
        use wgpu::DeviceType::*;
        assert!(preference_rank(DiscreteGpu, PowerPreference::HighPerformance) < preference_rank(IntegratedGpu, PowerPreference::HighPerformance));
        assert!(preference_rank(IntegratedGpu, PowerPreference::LowPower) < preference_rank(DiscreteGpu, PowerPreference::LowPower));
        assert!(preference_rank(Cpu, PowerPreference::LowPower) > preference_rank(VirtualGpu, PowerPreference::LowPower));
    }

    #[test]
    fn test_vram_estimate_bounds() {
        let info = wgpu::AdapterInfo {
            name: "test".into(),
            vendor: 0,
            device: 0,
            device_type: wgpu::DeviceType::DiscreteGpu,
            driver: String::new(),
            driver_info: String::new(),
            backend: wgpu::Backend::Vulkan,
        };
        if gpu_memory_override().is_none() {
            assert_eq!(estimate_vram(&info, 256 << 20), 2u64 << 30);
            assert_eq!(estimate_vram(&info, 64u64 << 30), 24u64 << 30);
        }
    }

    #[test]
    fn test_padding() {
        assert_eq!(padded(1), 4);
        assert_eq!(padded(8), 8);
        assert_eq!(padded(9), 12);
    }
}
