//! 2-D textures.

use std::sync::Arc;

use pixlane_core::TextureFormat;

use crate::backend::cpu::CpuTexture;
use crate::device::Device;
use crate::resource::{DeviceId, ResourceKind, Tracked};
use crate::{ComputeError, ComputeResult};

#[cfg(feature = "wgpu")]
use crate::backend::wgpu_backend::WgpuTexture;

pub(crate) enum RawTexture {
    Cpu(CpuTexture),
    #[cfg(feature = "wgpu")]
    Wgpu(WgpuTexture),
}

impl RawTexture {
    pub(crate) fn as_cpu(&self) -> Option<&CpuTexture> {
        match self {
            Self::Cpu(t) => Some(t),
            #[cfg(feature = "wgpu")]
            _ => None,
        }
    }

    #[cfg(feature = "wgpu")]
    pub(crate) fn as_wgpu(&self) -> Option<&WgpuTexture> {
        match self {
            Self::Wgpu(t) => Some(t),
            _ => None,
        }
    }
}

/// A 2-D image on a device.
///
/// Writable textures may be bound as storage textures (compute outputs);
/// all textures may be bound as sampled inputs.
#[derive(Clone)]
pub struct Texture {
    inner: Arc<TextureInner>,
}

struct TextureInner {
    device: DeviceId,
    width: u32,
    height: u32,
    format: TextureFormat,
    writable: bool,
    renderable: bool,
    raw: RawTexture,
    _tracked: Tracked,
}

impl Texture {
    pub(crate) fn from_raw(
        device: &Device,
        width: u32,
        height: u32,
        format: TextureFormat,
        writable: bool,
        renderable: bool,
        raw: RawTexture,
    ) -> Self {
        Self {
            inner: Arc::new(TextureInner {
                device: device.id(),
                width,
                height,
                format,
                writable,
                renderable,
                raw,
                _tracked: Tracked::new(device.counters(), ResourceKind::Texture),
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn format(&self) -> TextureFormat {
        self.inner.format
    }

    /// Whether the texture can be bound as a storage (write) texture.
    pub fn is_writable(&self) -> bool {
        self.inner.writable
    }

    /// Whether the texture can be a render target.
    pub fn is_renderable(&self) -> bool {
        self.inner.renderable
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.device
    }

    pub(crate) fn raw(&self) -> &RawTexture {
        &self.inner.raw
    }

    /// Tightly packed bytes of one row.
    pub fn row_bytes(&self) -> usize {
        self.format().row_bytes(self.width())
    }

    fn check_pitch(&self, bytes_per_row: usize) -> ComputeResult<()> {
        if bytes_per_row < self.row_bytes() {
            return Err(ComputeError::BufferSizeMismatch { expected: self.row_bytes(), actual: bytes_per_row });
        }
        Ok(())
    }

    /// Replaces the whole image with rows read `bytes_per_row` apart.
    pub fn upload(&self, bytes: &[u8], bytes_per_row: usize) -> ComputeResult<()> {
        self.check_pitch(bytes_per_row)?;
        let needed = bytes_per_row * (self.height() as usize - 1) + self.row_bytes();
        if bytes.len() < needed {
            return Err(ComputeError::BufferSizeMismatch { expected: needed, actual: bytes.len() });
        }
        match self.raw() {
            RawTexture::Cpu(t) => {
                t.upload(self.row_bytes(), bytes, bytes_per_row);
                Ok(())
            }
            #[cfg(feature = "wgpu")]
            RawTexture::Wgpu(t) => t.upload(bytes, bytes_per_row),
        }
    }

    /// Reads the whole image back, rows `bytes_per_row` apart.
    pub fn download(&self, bytes_per_row: usize) -> ComputeResult<Vec<u8>> {
        self.check_pitch(bytes_per_row)?;
        match self.raw() {
            RawTexture::Cpu(t) => Ok(t.download(self.row_bytes(), self.height(), bytes_per_row)),
            #[cfg(feature = "wgpu")]
            RawTexture::Wgpu(t) => t.download(bytes_per_row),
        }
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("format", &self.inner.format)
            .field("writable", &self.inner.writable)
            .field("device", &self.inner.device)
            .finish()
    }
}
