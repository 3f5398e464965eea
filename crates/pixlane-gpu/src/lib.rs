//! GPU command submission and pixel-format conversion.
//!
//! A layered object model over compute/render accelerators, with a CPU
//! backend that implements every operation and doubles as the test oracle.
//!
//! # Architecture
//!
//! ```text
//! ComputeContext (backend selector)
//!     └── Device ──────────────┬── Library ── Function ── ComputePipeline / RenderPipeline
//!             │                ├── Buffer (shared / managed / private)
//!             │                └── Texture
//!             └── CommandQueue
//!                     └── CommandBuffer ── ComputeEncoder / RenderEncoder / BlitEncoder
//!                             └── commit() ── CommittedCommandBuffer ── wait_until_completed()
//!
//! FrameConverter (RGBA f32 -> BGRA8 / P216) runs on the same command path.
//! ```
//!
//! Backends:
//!
//! - `Cpu` - host kernels on a dedicated rayon pool (always available)
//! - `NativeGpu` - wgpu on Vulkan / Metal / DX12 (feature `wgpu`)
//! - `AlternateGpu` - wgpu on OpenGL / GLES (feature `wgpu`)
//!
//! # Example
//!
//! ```rust
//! use pixlane_gpu::{Backend, Device, StorageMode};
//! use pixlane_core::{DispatchSize, ThreadgroupSize};
//!
//! const SHADER: &str = r#"
//! @group(0) @binding(0) var<storage, read_write> data: array<f32>;
//!
//! @compute @workgroup_size(4, 1, 1)
//! fn double_values(@builtin(global_invocation_id) id: vec3<u32>) {
//!     if id.x < arrayLength(&data) { data[id.x] = data[id.x] * 2.0; }
//! }
//! "#;
//!
//! let device = Device::new(Backend::Cpu)?;
//! device.register_host_kernel("double_values", |args| {
//!     for v in args.buffers.write::<f32>(0)? {
//!         *v *= 2.0;
//!     }
//!     Ok(())
//! });
//!
//! let library = device.compile_library(SHADER)?;
//! let pipeline = device.make_compute_pipeline(&library.function("double_values")?)?;
//! let buffer = device.new_buffer_with_data(bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]), StorageMode::Shared)?;
//!
//! let queue = device.new_command_queue()?;
//! let mut cmd = queue.new_command_buffer()?;
//! let mut enc = cmd.compute_encoder();
//! enc.set_pipeline(&pipeline);
//! enc.set_buffer(0, &buffer, 0);
//! enc.dispatch(DispatchSize::new(1, 1), ThreadgroupSize::new(4, 1));
//! enc.end();
//! cmd.commit().wait_until_completed()?;
//!
//! assert_eq!(buffer.download()?.to_vec_of::<f32>(), vec![2.0, 4.0, 6.0, 8.0]);
//! # Ok::<(), pixlane_gpu::ComputeError>(())
//! ```

pub mod backend;
pub mod buffer;
pub mod command;
pub mod config;
pub mod context;
pub mod convert;
pub mod device;
pub mod encoder;
pub mod library;
pub mod resource;
pub mod shaders;
pub mod texture;

pub use backend::{Backend, BackendInfo, HostKernel, KernelArgs, describe_backends, detect_backends, select_best_backend};
pub use buffer::{Buffer, BufferView, StorageMode};
pub use command::{CommandBuffer, CommandBufferStatus, CommandQueue, CommittedCommandBuffer, Drawable};
pub use config::{ContextConfig, PowerPreference};
pub use context::ComputeContext;
pub use convert::{FrameConverter, SourceImage};
pub use device::{Device, DeviceInfo, DeviceType};
pub use encoder::{BlitEncoder, ComputeEncoder, IndexType, LoadAction, PrimitiveType, RenderEncoder, RenderTarget};
pub use library::{BindingInfo, BindingKind, ComputePipeline, Function, FunctionStage, Library, RenderPipeline, RenderPipelineDescriptor};
pub use resource::{DeviceId, ResourceCounts};
pub use texture::Texture;

pub use pixlane_core::{DispatchSize, OutputFormat, TextureFormat, ThreadgroupSize};

use thiserror::Error;

/// Device, command path and conversion errors.
#[derive(Error, Debug)]
pub enum ComputeError {
    /// No device of the requested kind exists on this system.
    #[error("no suitable device found")]
    DeviceNotFound,

    /// The device refused a new command queue.
    #[error("failed to create command queue: {0}")]
    CommandQueueCreation(String),

    /// Shader source failed to parse or validate. Carries the compiler diagnostic.
    #[error("failed to create library:\n{0}")]
    LibraryCreation(String),

    /// No entry point of that name in the library.
    #[error("function not found in library: {0}")]
    FunctionNotFound(String),

    /// Pipeline construction failed. Carries the backend diagnostic.
    #[error("failed to create pipeline: {0}")]
    PipelineCreation(String),

    /// Buffer allocation failed, or a buffer is too small for its use.
    #[error("failed to create buffer: {0}")]
    BufferCreation(String),

    /// Texture allocation failed or the texture parameters are unsupported.
    #[error("failed to create texture: {0}")]
    TextureCreation(String),

    /// The queue can no longer accept command buffers.
    #[error("failed to create command buffer: {0}")]
    CommandBufferCreation(String),

    /// The active backend does not implement this operation.
    #[error("{operation} is not implemented by the {backend} backend")]
    NotImplemented {
        /// Backend name
        backend: &'static str,
        /// Operation that was requested
        operation: &'static str,
    },

    /// The requested backend cannot open a device on this system.
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    /// Host access to a buffer whose storage mode forbids it.
    #[error("{mode:?} buffer contents are not host accessible")]
    HostAccess {
        /// Storage mode of the buffer
        mode: StorageMode,
    },

    /// Host data or a destination does not have the byte length required.
    #[error("buffer size mismatch: expected {expected}, got {actual}")]
    BufferSizeMismatch {
        /// Required length in bytes
        expected: usize,
        /// Length that was supplied
        actual: usize,
    },

    /// Byte range outside a buffer, or not 4-byte aligned.
    #[error("invalid range {offset}..{end} for buffer of {len} bytes")]
    InvalidRange {
        /// Start of the range
        offset: usize,
        /// End of the range (exclusive)
        end: usize,
        /// Buffer length in bytes
        len: usize,
    },

    /// Image dimensions are zero or do not match the source.
    #[error("invalid dimensions: {0}x{1}")]
    InvalidDimensions(u32, u32),

    /// Committed work failed on the device.
    #[error("command buffer execution failed: {0}")]
    Execution(String),

    /// Format or layout validation failed.
    #[error(transparent)]
    Core(#[from] pixlane_core::Error),
}

/// Result type alias using [`ComputeError`].
pub type ComputeResult<T> = Result<T, ComputeError>;
