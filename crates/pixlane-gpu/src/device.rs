//! Devices: the factory for every other object.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use pixlane_core::TextureFormat;
use tracing::{debug, warn};

use crate::backend::cpu::{self, CpuBuffer, CpuDevice, CpuTexture};
use crate::backend::{Backend, HostKernel, KernelArgs, RawQueue, builtin_kernels};
use crate::buffer::{Buffer, RawBuffer, StorageMode};
use crate::command::CommandQueue;
use crate::config::ContextConfig;
use crate::library::{
    ComputePipeline, Function, FunctionStage, Library, RawComputePipeline, RawLibrary, RenderPipeline,
    RenderPipelineDescriptor, compile_wgsl,
};
use crate::resource::{Counters, DeviceId, ResourceCounts};
use crate::texture::{RawTexture, Texture};
use crate::{ComputeError, ComputeResult};

#[cfg(feature = "wgpu")]
use crate::backend::wgpu_backend::{self, WgpuDevice};
#[cfg(feature = "wgpu")]
use crate::library::RawRenderPipeline;

/// Kind of physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

/// Description of a device, available before opening it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub backend: Backend,
    pub device_type: DeviceType,
    /// Host and device share memory; shared buffers download without a copy.
    pub unified_memory: bool,
    pub max_buffer_size: u64,
    pub max_texture_dimension: u32,
    /// Total (CPU) or estimated (GPU) memory in bytes.
    pub memory_bytes: u64,
}

pub(crate) enum RawDevice {
    Cpu(CpuDevice),
    #[cfg(feature = "wgpu")]
    Wgpu(WgpuDevice),
}

/// An opened accelerator.
///
/// Cloning shares the device. Every object it creates remembers its
/// [`DeviceId`], which encoders check before binding it. Resources do not
/// keep the device open; on the wgpu backend they hold their own
/// reference to the underlying `wgpu::Device`.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    id: DeviceId,
    label: String,
    raw: RawDevice,
    counters: Arc<Counters>,
    kernels: RwLock<HashMap<String, HostKernel>>,
    next_queue: AtomicUsize,
}

impl Device {
    /// Whether `backend` can open a device. Pure probe.
    pub fn is_available(backend: Backend) -> bool {
        backend.is_available()
    }

    /// Opens the system default GPU: native API first, then alternate.
    ///
    /// Never falls back to the CPU; use [`ComputeContext`](crate::ComputeContext)
    /// for that.
    pub fn system_default() -> ComputeResult<Self> {
        let config = ContextConfig::default();
        for backend in [Backend::NativeGpu, Backend::AlternateGpu] {
            if !backend.is_available() {
                continue;
            }
            match Self::with_config(backend, &config) {
                Ok(device) => return Ok(device),
                Err(e) => warn!(%backend, error = %e, "default device failed to open"),
            }
        }
        Err(ComputeError::DeviceNotFound)
    }

    /// Opens the first device of `backend` with default configuration.
    pub fn new(backend: Backend) -> ComputeResult<Self> {
        Self::with_config(backend, &ContextConfig::default())
    }

    /// Opens the first device of `backend`.
    ///
    /// `Backend::Auto` tries native GPU, alternate GPU and CPU in order.
    pub fn with_config(backend: Backend, config: &ContextConfig) -> ComputeResult<Self> {
        match backend {
            Backend::Auto => {
                let mut last = ComputeError::DeviceNotFound;
                for candidate in backend.candidates() {
                    match Self::with_config(*candidate, config) {
                        Ok(device) => return Ok(device),
                        Err(e) => last = e,
                    }
                }
                Err(last)
            }
            Backend::Cpu => Ok(Self::from_raw(RawDevice::Cpu(CpuDevice::open(config.cpu_threads, &config.label)?), config)),
            #[cfg(feature = "wgpu")]
            Backend::NativeGpu | Backend::AlternateGpu => {
                Ok(Self::from_raw(RawDevice::Wgpu(WgpuDevice::open(backend, config, None)?), config))
            }
            #[cfg(not(feature = "wgpu"))]
            Backend::NativeGpu | Backend::AlternateGpu => {
                Err(ComputeError::BackendNotAvailable(format!("{backend} (built without the `wgpu` feature)")))
            }
        }
    }

    /// Lists the devices `backend` can open, in [`with_index`](Self::with_index) order.
    pub fn enumerate(backend: Backend) -> Vec<DeviceInfo> {
        match backend {
            Backend::Auto => backend.candidates().iter().flat_map(|b| Self::enumerate(*b)).collect(),
            Backend::Cpu => cpu::enumerate(),
            #[cfg(feature = "wgpu")]
            Backend::NativeGpu | Backend::AlternateGpu => wgpu_backend::enumerate(backend),
            #[cfg(not(feature = "wgpu"))]
            Backend::NativeGpu | Backend::AlternateGpu => Vec::new(),
        }
    }

    /// Opens the `index`-th device listed by [`enumerate`](Self::enumerate).
    pub fn with_index(backend: Backend, index: usize) -> ComputeResult<Self> {
        let config = ContextConfig::default();
        match backend {
            Backend::Auto => {
                let mut index = index;
                for candidate in backend.candidates() {
                    let count = Self::enumerate(*candidate).len();
                    if index < count {
                        return Self::with_index(*candidate, index);
                    }
                    index -= count;
                }
                Err(ComputeError::DeviceNotFound)
            }
            Backend::Cpu if index == 0 => Self::with_config(Backend::Cpu, &config),
            Backend::Cpu => Err(ComputeError::DeviceNotFound),
            #[cfg(feature = "wgpu")]
            Backend::NativeGpu | Backend::AlternateGpu => {
                Ok(Self::from_raw(RawDevice::Wgpu(WgpuDevice::open(backend, &config, Some(index))?), &config))
            }
            #[cfg(not(feature = "wgpu"))]
            Backend::NativeGpu | Backend::AlternateGpu => Err(ComputeError::DeviceNotFound),
        }
    }

    fn from_raw(raw: RawDevice, config: &ContextConfig) -> Self {
        let kernels = builtin_kernels().into_iter().map(|(name, k)| (name.to_string(), k)).collect();
        let device = Self {
            inner: Arc::new(DeviceInner {
                id: DeviceId::next(),
                label: config.label.clone(),
                raw,
                counters: Arc::new(Counters::default()),
                kernels: RwLock::new(kernels),
                next_queue: AtomicUsize::new(0),
            }),
        };
        debug!(id = %device.id(), name = device.name(), backend = %device.backend(), "device opened");
        device
    }

    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    pub fn info(&self) -> &DeviceInfo {
        match &self.inner.raw {
            RawDevice::Cpu(d) => d.info(),
            #[cfg(feature = "wgpu")]
            RawDevice::Wgpu(d) => d.info(),
        }
    }

    pub fn name(&self) -> &str {
        &self.info().name
    }

    pub fn backend(&self) -> Backend {
        self.info().backend
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Live objects created by this device.
    pub fn live_resources(&self) -> ResourceCounts {
        self.inner.counters.snapshot()
    }

    pub(crate) fn counters(&self) -> &Arc<Counters> {
        &self.inner.counters
    }

    // =========================================================================
    // Factories
    // =========================================================================

    pub fn new_command_queue(&self) -> ComputeResult<CommandQueue> {
        let n = self.inner.next_queue.fetch_add(1, Ordering::Relaxed);
        let label = format!("{}-queue-{n}", self.inner.label);
        let raw = match &self.inner.raw {
            RawDevice::Cpu(d) => RawQueue::Cpu(d.new_queue(&label)?),
            #[cfg(feature = "wgpu")]
            RawDevice::Wgpu(d) => RawQueue::Wgpu(d.new_queue(&label)?),
        };
        debug!(queue = %label, "command queue created");
        Ok(CommandQueue::from_raw(self, label, raw))
    }

    /// Compiles WGSL source.
    ///
    /// Fails with [`ComputeError::LibraryCreation`] carrying the compiler
    /// diagnostic; the caller decides whether to log or retry.
    pub fn compile_library(&self, source: &str) -> ComputeResult<Library> {
        let (module, info) = compile_wgsl(source)?;
        let raw = match &self.inner.raw {
            RawDevice::Cpu(_) => RawLibrary::Cpu,
            #[cfg(feature = "wgpu")]
            RawDevice::Wgpu(d) => RawLibrary::Wgpu(d.create_shader_module(source)?),
        };
        let library = Library::new(self, &module, &info, raw);
        debug!(functions = ?library.function_names(), "library compiled");
        Ok(library)
    }

    fn check_owner(&self, function: &Function) -> ComputeResult<()> {
        if function.device_id() != self.id() {
            return Err(ComputeError::PipelineCreation(format!(
                "`{}` was compiled on {}, not {}",
                function.name(),
                function.device_id(),
                self.id()
            )));
        }
        Ok(())
    }

    /// Builds a compute pipeline from a compute entry point.
    ///
    /// On the CPU backend the entry point runs the host kernel registered
    /// under its name.
    pub fn make_compute_pipeline(&self, function: &Function) -> ComputeResult<ComputePipeline> {
        self.check_owner(function)?;
        function.expect_stage(FunctionStage::Compute)?;
        function.check_bindings()?;

        let raw = match &self.inner.raw {
            RawDevice::Cpu(_) => {
                let kernel = self.host_kernel(function.name()).ok_or_else(|| {
                    ComputeError::PipelineCreation(format!("no host kernel registered for `{}`", function.name()))
                })?;
                RawComputePipeline::Host(kernel)
            }
            #[cfg(feature = "wgpu")]
            RawDevice::Wgpu(d) => RawComputePipeline::Wgpu(d.make_compute_pipeline(function)?),
        };
        Ok(ComputePipeline::from_raw(self, function.clone(), raw))
    }

    /// Builds a render pipeline. Not available on the CPU backend.
    pub fn make_render_pipeline(&self, descriptor: &RenderPipelineDescriptor) -> ComputeResult<RenderPipeline> {
        self.check_owner(&descriptor.vertex)?;
        self.check_owner(&descriptor.fragment)?;

        match &self.inner.raw {
            RawDevice::Cpu(_) => {
                descriptor.merged_bindings()?;
                Err(ComputeError::NotImplemented { backend: "cpu", operation: "render pipelines" })
            }
            #[cfg(feature = "wgpu")]
            RawDevice::Wgpu(d) => {
                let bindings = descriptor.merged_bindings()?;
                let raw = d.make_render_pipeline(descriptor, &bindings)?;
                Ok(RenderPipeline::from_raw(self, descriptor.clone(), bindings, RawRenderPipeline::Wgpu(raw)))
            }
        }
    }

    /// Allocates a zeroed buffer of `len` bytes.
    pub fn new_buffer(&self, len: usize, mode: StorageMode) -> ComputeResult<Buffer> {
        if len == 0 {
            return Err(ComputeError::BufferCreation("zero-length buffer".into()));
        }
        let max = self.info().max_buffer_size;
        if len as u64 > max {
            return Err(ComputeError::BufferCreation(format!("{len} bytes exceeds the device limit of {max}")));
        }
        let raw = match &self.inner.raw {
            RawDevice::Cpu(_) => RawBuffer::Cpu(CpuBuffer::new(len)?),
            #[cfg(feature = "wgpu")]
            RawDevice::Wgpu(d) => RawBuffer::Wgpu(d.new_buffer(len, mode)?),
        };
        Ok(Buffer::from_raw(self, len, mode, raw))
    }

    /// Allocates a buffer holding a copy of `bytes`.
    pub fn new_buffer_with_data(&self, bytes: &[u8], mode: StorageMode) -> ComputeResult<Buffer> {
        let buffer = self.new_buffer(bytes.len(), mode)?;
        buffer.upload(0, bytes)?;
        Ok(buffer)
    }

    /// Allocates a zeroed `width x height` texture.
    ///
    /// `writable` textures can be bound as storage textures.
    pub fn new_texture(&self, width: u32, height: u32, format: TextureFormat, writable: bool) -> ComputeResult<Texture> {
        if width == 0 || height == 0 {
            return Err(ComputeError::TextureCreation(format!("{width}x{height} has a zero extent")));
        }
        let max = self.info().max_texture_dimension;
        if width > max || height > max {
            return Err(ComputeError::TextureCreation(format!("{width}x{height} exceeds the device limit of {max}")));
        }
        let (raw, renderable) = match &self.inner.raw {
            RawDevice::Cpu(_) => (RawTexture::Cpu(CpuTexture::new(width, height, format)?), true),
            #[cfg(feature = "wgpu")]
            RawDevice::Wgpu(d) => {
                let (texture, renderable) = d.new_texture(width, height, format, writable)?;
                (RawTexture::Wgpu(texture), renderable)
            }
        };
        Ok(Texture::from_raw(self, width, height, format, writable, renderable, raw))
    }

    /// Registers (or replaces) the host kernel run for entry point `name`
    /// on the CPU backend. Pipelines already created keep their kernel.
    pub fn register_host_kernel<F>(&self, name: &str, kernel: F)
    where
        F: Fn(&mut KernelArgs<'_>) -> ComputeResult<()> + Send + Sync + 'static,
    {
        let mut kernels = self.inner.kernels.write().unwrap_or_else(PoisonError::into_inner);
        kernels.insert(name.to_string(), Arc::new(kernel));
    }

    pub(crate) fn host_kernel(&self, name: &str) -> Option<HostKernel> {
        let kernels = self.inner.kernels.read().unwrap_or_else(PoisonError::into_inner);
        kernels.get(name).cloned()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("name", &self.name())
            .field("backend", &self.backend())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_device_info() {
        let device = Device::new(Backend::Cpu).unwrap();
        assert_eq!(device.backend(), Backend::Cpu);
        assert!(device.info().unified_memory);
        assert!(device.info().memory_bytes > 0);
    }

    #[test]
    fn test_builtin_kernels_registered() {
        let device = Device::new(Backend::Cpu).unwrap();
        assert!(device.host_kernel("rgba_to_p216").is_some());
        assert!(device.host_kernel("missing").is_none());
    }

    #[test]
    fn test_zero_sized_resources_rejected() {
        let device = Device::new(Backend::Cpu).unwrap();
        assert!(matches!(device.new_buffer(0, StorageMode::Shared), Err(ComputeError::BufferCreation(_))));
        assert!(matches!(
            device.new_texture(0, 4, TextureFormat::Rgba8Unorm, false),
            Err(ComputeError::TextureCreation(_))
        ));
        assert_eq!(device.live_resources(), ResourceCounts::default());
    }

    #[test]
    fn test_cpu_with_index() {
        assert!(Device::with_index(Backend::Cpu, 0).is_ok());
        assert!(matches!(Device::with_index(Backend::Cpu, 1), Err(ComputeError::DeviceNotFound)));
    }
}
