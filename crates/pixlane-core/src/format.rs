//! Texture and output pixel formats.
//!
//! # Types
//!
//! - [`TextureFormat`] - Formats a device texture can be created with
//! - [`OutputFormat`] - Formats the conversion pipeline produces
//! - [`PlaneLayout`], [`Plane`] - Byte layout of an output frame
//!
//! # Usage
//!
//! ```rust
//! use pixlane_core::format::OutputFormat;
//!
//! // 1920x1080 BGRA: one plane, 4 bytes per pixel
//! assert_eq!(OutputFormat::Bgra8.required_bytes(1920, 1080).unwrap(), 1920 * 1080 * 4);
//!
//! // 4:2:2 two-plane 16-bit: luma plane followed by interleaved CbCr plane
//! let layout = OutputFormat::P216.layout(1920, 1080).unwrap();
//! assert_eq!(layout.planes()[1].offset, 1920 * 1080 * 2);
//! assert_eq!(layout.total_bytes, 1920 * 1080 * 4);
//! ```

use crate::error::{Error, Result};
use crate::grid::{DispatchSize, ThreadgroupSize};

/// Pixel format of a device texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFormat {
    /// 8-bit normalized RGBA.
    Rgba8Unorm,
    /// 8-bit normalized BGRA (swapchain order).
    Bgra8Unorm,
    /// 16-bit float RGBA.
    Rgba16Float,
    /// 32-bit float RGBA.
    #[default]
    Rgba32Float,
    /// Single 32-bit float channel.
    R32Float,
}

impl TextureFormat {
    /// Bytes per texel.
    #[inline]
    pub const fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Rgba8Unorm | Self::Bgra8Unorm => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
            Self::R32Float => 4,
        }
    }

    /// Number of channels stored per texel.
    #[inline]
    pub const fn channels(&self) -> u32 {
        match self {
            Self::R32Float => 1,
            _ => 4,
        }
    }

    /// Whether texels hold floating-point values.
    #[inline]
    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Rgba16Float | Self::Rgba32Float | Self::R32Float)
    }

    /// Lowercase name matching the WGSL storage format spelling.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Rgba8Unorm => "rgba8unorm",
            Self::Bgra8Unorm => "bgra8unorm",
            Self::Rgba16Float => "rgba16float",
            Self::Rgba32Float => "rgba32float",
            Self::R32Float => "r32float",
        }
    }

    /// Tightly packed row size in bytes.
    pub fn row_bytes(&self, width: u32) -> usize {
        width as usize * self.bytes_per_pixel()
    }
}

impl std::fmt::Display for TextureFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Output format of the pixel conversion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    /// 8-bit packed BGRA, one byte per channel, B first in memory.
    Bgra8,
    /// 10-bit 4:2:2 in two 16-bit planes: full-resolution luma followed by
    /// interleaved Cb/Cr at half horizontal resolution.
    ///
    /// Both planes hold `width` samples per row. On odd widths the lone last
    /// pixel keeps its Cb sample and its Cr sample is dropped.
    P216,
}

impl OutputFormat {
    /// Threadgroup shape used by every conversion kernel.
    pub const THREADGROUP: ThreadgroupSize = ThreadgroupSize::new(16, 16);

    /// Short name used in logs and kernel names.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Bgra8 => "bgra8",
            Self::P216 => "p216",
        }
    }

    /// Horizontal pixels handled by one kernel thread.
    ///
    /// Two luma samples share one chroma pair in 4:2:2, so the P216 kernels
    /// process pixel pairs. On odd widths the last pixel of a row is paired
    /// with itself.
    pub const fn pixels_per_thread(&self) -> u32 {
        match self {
            Self::Bgra8 => 1,
            Self::P216 => 2,
        }
    }

    /// Validates geometry and returns the byte layout of one frame.
    pub fn layout(&self, width: u32, height: u32) -> Result<PlaneLayout> {
        if width == 0 || height == 0 {
            return Err(Error::invalid_dimensions(width, height, "width and height must be non-zero"));
        }
        let pixels = (width as usize)
            .checked_mul(height as usize)
            .ok_or(Error::SizeOverflow { width, height })?;
        let overflow = || Error::SizeOverflow { width, height };

        match self {
            Self::Bgra8 => {
                let len = pixels.checked_mul(4).ok_or_else(overflow)?;
                Ok(PlaneLayout {
                    format: *self,
                    width,
                    height,
                    planes: [
                        Plane { offset: 0, len, row_bytes: width as usize * 4 },
                        Plane::EMPTY,
                    ],
                    plane_count: 1,
                    total_bytes: len,
                })
            }
            Self::P216 => {
                let plane = pixels.checked_mul(2).ok_or_else(overflow)?;
                let total = plane.checked_mul(2).ok_or_else(overflow)?;
                let row_bytes = width as usize * 2;
                Ok(PlaneLayout {
                    format: *self,
                    width,
                    height,
                    planes: [
                        Plane { offset: 0, len: plane, row_bytes },
                        Plane { offset: plane, len: plane, row_bytes },
                    ],
                    plane_count: 2,
                    total_bytes: total,
                })
            }
        }
    }

    /// Exact byte size of one frame.
    pub fn required_bytes(&self, width: u32, height: u32) -> Result<usize> {
        Ok(self.layout(width, height)?.total_bytes)
    }

    /// Threadgroup grid for a `width x height` conversion.
    pub fn dispatch_grid(&self, width: u32, height: u32) -> DispatchSize {
        let threads_x = width.div_ceil(self.pixels_per_thread());
        DispatchSize::covering(threads_x, height, Self::THREADGROUP)
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One plane of an output frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    /// Byte offset from the start of the frame.
    pub offset: usize,
    /// Plane length in bytes.
    pub len: usize,
    /// Bytes per row.
    pub row_bytes: usize,
}

impl Plane {
    const EMPTY: Self = Self { offset: 0, len: 0, row_bytes: 0 };

    /// Byte range of this plane within the frame.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Byte layout of one output frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Format the layout describes.
    pub format: OutputFormat,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    planes: [Plane; 2],
    plane_count: usize,
    /// Total frame size in bytes.
    pub total_bytes: usize,
}

impl PlaneLayout {
    /// Planes in memory order.
    pub fn planes(&self) -> &[Plane] {
        &self.planes[..self.plane_count]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bgra_size() {
        for (w, h) in [(1, 1), (17, 13), (1920, 1080)] {
            assert_eq!(OutputFormat::Bgra8.required_bytes(w, h).unwrap(), (w * h * 4) as usize);
        }
    }

    #[test]
    fn test_p216_planes_are_equal_halves() {
        for (w, h) in [(2, 1), (18, 13), (1920, 1080)] {
            let layout = OutputFormat::P216.layout(w, h).unwrap();
            let planes = layout.planes();
            assert_eq!(planes.len(), 2);
            assert_eq!(planes[0].len, (w * h * 2) as usize);
            assert_eq!(planes[1].len, planes[0].len);
            assert_eq!(planes[1].offset, planes[0].len);
            assert_eq!(layout.total_bytes, (w * h * 4) as usize);
        }
    }

    #[test]
    fn test_p216_odd_width_length() {
        for (w, h) in [(1, 1), (17, 13), (3, 2)] {
            let layout = OutputFormat::P216.layout(w, h).unwrap();
            assert_eq!(layout.total_bytes, (w * h * 4) as usize);
            assert_eq!(layout.planes()[1].offset, (w * h * 2) as usize);
            assert_eq!(layout.planes()[0].row_bytes, (w * 2) as usize);
        }
    }

    #[test]
    fn test_zero_extent_rejected() {
        assert!(OutputFormat::Bgra8.layout(0, 10).is_err());
        assert!(OutputFormat::Bgra8.layout(10, 0).is_err());
    }

    #[test]
    fn test_p216_grid_processes_pairs() {
        let grid = OutputFormat::P216.dispatch_grid(1920, 1080);
        // 960 pairs / 16 = 60, 1080 / 16 = 67.5 -> 68
        assert_eq!(grid, DispatchSize::new(60, 68));
        let grid = OutputFormat::Bgra8.dispatch_grid(1920, 1080);
        assert_eq!(grid, DispatchSize::new(120, 68));
        // 17 pixels -> 9 pairs, the last one a single pixel.
        assert_eq!(OutputFormat::P216.dispatch_grid(17, 13), DispatchSize::new(1, 1));
        assert_eq!(OutputFormat::P216.dispatch_grid(33, 1), DispatchSize::new(2, 1));
        assert_eq!(OutputFormat::P216.dispatch_grid(1, 1), DispatchSize::new(1, 1));
    }

    #[test]
    fn test_texture_format_sizes() {
        assert_eq!(TextureFormat::Rgba32Float.bytes_per_pixel(), 16);
        assert_eq!(TextureFormat::Rgba16Float.bytes_per_pixel(), 8);
        assert_eq!(TextureFormat::Bgra8Unorm.row_bytes(3), 12);
        assert_eq!(TextureFormat::R32Float.channels(), 1);
    }
}
