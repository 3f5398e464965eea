//! RGBA float to BGRA8 / P216 conversion on the command path.
//!
//! Pick the entry point by where the source already lives; nothing is
//! auto-detected:
//!
//! | Source residency       | Entry point                              | Extra copy        |
//! |------------------------|------------------------------------------|-------------------|
//! | host `&[f32]`          | [`FrameConverter::convert_host`]         | upload to scratch |
//! | device [`Buffer`]      | [`FrameConverter::convert_buffer`]       | none              |
//! | device [`Texture`]     | [`FrameConverter::convert_texture`]      | none (sampled)    |
//!
//! Sources are tightly packed RGBA `f32` (16 bytes per pixel). Output goes
//! to a caller-owned buffer of at least [`OutputFormat::required_bytes`];
//! sizes are checked before any work is encoded. On unified-memory devices
//! `output.download()` is a view of the buffer, not a copy.

pub mod reference;

use pixlane_core::{OutputFormat, PlaneLayout};
use tracing::trace;

use crate::command::{CommandBuffer, CommandQueue};
use crate::device::Device;
use crate::library::ComputePipeline;
use crate::shaders::CONVERT_KERNELS;
use crate::{Buffer, ComputeError, ComputeResult, StorageMode, Texture};

/// Bytes per source pixel (RGBA `f32`).
pub const SOURCE_BYTES_PER_PIXEL: usize = 16;

/// Where the source image lives.
#[derive(Debug, Clone, Copy)]
pub enum SourceImage<'a> {
    /// Host memory; uploaded before conversion.
    Host(&'a [f32]),
    /// Device buffer, used directly.
    Buffer(&'a Buffer),
    /// Device texture, sampled directly.
    Texture(&'a Texture),
}

#[derive(Clone, Copy)]
enum DeviceSource<'a> {
    Buffer(&'a Buffer),
    Texture(&'a Texture),
}

/// Compiled conversion kernels plus a reusable upload buffer.
pub struct FrameConverter {
    device: Device,
    queue: CommandQueue,
    bgra8_from_buffer: ComputePipeline,
    bgra8_from_texture: ComputePipeline,
    p216_from_buffer: ComputePipeline,
    p216_from_texture: ComputePipeline,
    scratch: Option<Buffer>,
}

impl FrameConverter {
    /// Compiles the conversion kernels on `queue`'s device.
    pub fn new(queue: &CommandQueue) -> ComputeResult<Self> {
        let device = queue.device().clone();
        let library = device.compile_library(CONVERT_KERNELS)?;
        let pipeline = |name: &str| device.make_compute_pipeline(&library.function(name)?);
        Ok(Self {
            bgra8_from_buffer: pipeline("rgba_to_bgra8")?,
            bgra8_from_texture: pipeline("texture_to_bgra8")?,
            p216_from_buffer: pipeline("rgba_to_p216")?,
            p216_from_texture: pipeline("texture_to_p216")?,
            queue: queue.clone(),
            device,
            scratch: None,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Converts host pixels: uploads into a scratch buffer, then converts it.
    pub fn convert_host(
        &mut self,
        src: &[f32],
        output: &Buffer,
        width: u32,
        height: u32,
        format: OutputFormat,
    ) -> ComputeResult<()> {
        let layout = check_output(output, width, height, format)?;
        let expected = pixel_count(width, height) * 4;
        if src.len() != expected {
            return Err(ComputeError::BufferSizeMismatch { expected, actual: src.len() });
        }

        let len = expected * std::mem::size_of::<f32>();
        let scratch = match self.scratch.take() {
            Some(buffer) if buffer.len() == len => buffer,
            _ => {
                trace!(bytes = len, "allocating conversion scratch buffer");
                self.device.new_buffer(len, StorageMode::Shared)?
            }
        };
        scratch.upload(0, bytemuck::cast_slice(src))?;
        let result = self.run(DeviceSource::Buffer(&scratch), output, &layout);
        self.scratch = Some(scratch);
        result
    }

    /// Converts a device buffer of packed RGBA `f32` in place on the device.
    pub fn convert_buffer(
        &mut self,
        src: &Buffer,
        output: &Buffer,
        width: u32,
        height: u32,
        format: OutputFormat,
    ) -> ComputeResult<()> {
        let layout = check_output(output, width, height, format)?;
        check_buffer_source(src, width, height)?;
        self.run(DeviceSource::Buffer(src), output, &layout)
    }

    /// Converts a texture by sampling it. Its size must be `width x height`.
    pub fn convert_texture(
        &mut self,
        src: &Texture,
        output: &Buffer,
        width: u32,
        height: u32,
        format: OutputFormat,
    ) -> ComputeResult<()> {
        let layout = check_output(output, width, height, format)?;
        check_texture_source(src, width, height)?;
        self.run(DeviceSource::Texture(src), output, &layout)
    }

    /// Forwards to the entry point named by `source`.
    pub fn convert(
        &mut self,
        source: SourceImage<'_>,
        output: &Buffer,
        width: u32,
        height: u32,
        format: OutputFormat,
    ) -> ComputeResult<()> {
        match source {
            SourceImage::Host(src) => self.convert_host(src, output, width, height, format),
            SourceImage::Buffer(src) => self.convert_buffer(src, output, width, height, format),
            SourceImage::Texture(src) => self.convert_texture(src, output, width, height, format),
        }
    }

    /// Records a buffer conversion into `cmd` without committing it.
    pub fn encode_buffer(
        &self,
        cmd: &mut CommandBuffer,
        src: &Buffer,
        output: &Buffer,
        width: u32,
        height: u32,
        format: OutputFormat,
    ) -> ComputeResult<()> {
        let layout = check_output(output, width, height, format)?;
        check_buffer_source(src, width, height)?;
        self.encode(cmd, DeviceSource::Buffer(src), output, &layout);
        Ok(())
    }

    /// Records a texture conversion into `cmd` without committing it.
    pub fn encode_texture(
        &self,
        cmd: &mut CommandBuffer,
        src: &Texture,
        output: &Buffer,
        width: u32,
        height: u32,
        format: OutputFormat,
    ) -> ComputeResult<()> {
        let layout = check_output(output, width, height, format)?;
        check_texture_source(src, width, height)?;
        self.encode(cmd, DeviceSource::Texture(src), output, &layout);
        Ok(())
    }

    fn run(&self, src: DeviceSource<'_>, output: &Buffer, layout: &PlaneLayout) -> ComputeResult<()> {
        let mut cmd = self.queue.new_command_buffer()?;
        self.encode(&mut cmd, src, output, layout);
        cmd.commit().wait_until_completed()
    }

    fn encode(&self, cmd: &mut CommandBuffer, src: DeviceSource<'_>, output: &Buffer, layout: &PlaneLayout) {
        let pipeline = match (layout.format, src) {
            (OutputFormat::Bgra8, DeviceSource::Buffer(_)) => &self.bgra8_from_buffer,
            (OutputFormat::Bgra8, DeviceSource::Texture(_)) => &self.bgra8_from_texture,
            (OutputFormat::P216, DeviceSource::Buffer(_)) => &self.p216_from_buffer,
            (OutputFormat::P216, DeviceSource::Texture(_)) => &self.p216_from_texture,
        };
        let dims = [layout.width, layout.height, 0, 0];
        let grid = layout.format.dispatch_grid(layout.width, layout.height);
        trace!(kernel = pipeline.name(), width = layout.width, height = layout.height, ?grid, "encode conversion");

        let mut enc = cmd.compute_encoder();
        enc.set_pipeline(pipeline);
        match src {
            DeviceSource::Buffer(buffer) => enc.set_buffer(0, buffer, 0),
            DeviceSource::Texture(texture) => enc.set_texture(0, texture),
        }
        enc.set_buffer(1, output, 0);
        enc.set_bytes(2, bytemuck::cast_slice(&dims));
        enc.dispatch(grid, OutputFormat::THREADGROUP);
        enc.end();
    }
}

impl std::fmt::Debug for FrameConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameConverter")
            .field("device", &self.device.name())
            .field("scratch", &self.scratch.as_ref().map(Buffer::len))
            .finish()
    }
}

fn pixel_count(width: u32, height: u32) -> usize {
    width as usize * height as usize
}

/// Validates geometry and the output size. Runs before anything is encoded.
fn check_output(output: &Buffer, width: u32, height: u32, format: OutputFormat) -> ComputeResult<PlaneLayout> {
    let layout = format.layout(width, height)?;
    if output.len() < layout.total_bytes {
        return Err(ComputeError::BufferCreation(format!(
            "output buffer holds {} bytes, {format} {width}x{height} needs {}",
            output.len(),
            layout.total_bytes
        )));
    }
    Ok(layout)
}

fn check_buffer_source(src: &Buffer, width: u32, height: u32) -> ComputeResult<()> {
    let expected = pixel_count(width, height) * SOURCE_BYTES_PER_PIXEL;
    if src.len() < expected {
        return Err(ComputeError::BufferSizeMismatch { expected, actual: src.len() });
    }
    Ok(())
}

fn check_texture_source(src: &Texture, width: u32, height: u32) -> ComputeResult<()> {
    if src.width() != width || src.height() != height {
        return Err(ComputeError::InvalidDimensions(src.width(), src.height()));
    }
    Ok(())
}
