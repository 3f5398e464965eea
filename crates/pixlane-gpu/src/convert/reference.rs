//! Reference conversions on host memory.
//!
//! These are the oracle for every backend: the CPU host kernels call the
//! same region helpers, and GPU results are compared against them in tests.
//! Images are tightly packed RGBA `f32`, processed row-major.

use pixlane_core::OutputFormat;
use pixlane_core::pixel::{rgba_pair_to_p216, rgba_to_bgra8 as bgra8_pixel};
use rayon::prelude::*;

use crate::{ComputeError, ComputeResult};

fn check_source(src: &[f32], width: u32, height: u32) -> ComputeResult<()> {
    if width == 0 || height == 0 {
        return Err(ComputeError::InvalidDimensions(width, height));
    }
    let expected = width as usize * height as usize * 4;
    if src.len() != expected {
        return Err(ComputeError::BufferSizeMismatch { expected, actual: src.len() });
    }
    Ok(())
}

/// RGBA pixel `(x, y)` of a packed image, zero outside it.
#[inline]
pub(crate) fn load_packed(src: &[f32], width: u32, x: u32, y: u32) -> [f32; 4] {
    let i = (y as usize * width as usize + x as usize) * 4;
    match src.get(i..i + 4) {
        Some(px) if x < width => [px[0], px[1], px[2], px[3]],
        _ => [0.0; 4],
    }
}

/// Fails unless `len` covers `need` bytes of destination.
fn check_destination(len: usize, need: usize) -> ComputeResult<()> {
    if len < need {
        return Err(ComputeError::BufferSizeMismatch { expected: need, actual: len });
    }
    Ok(())
}

/// Inverts RGB in place (`1 - v`) for the first `cols x rows` pixels.
pub(crate) fn invert_region(data: &mut [f32], width: u32, cols: u32, rows: u32) -> ComputeResult<()> {
    check_destination(data.len() * 4, width as usize * rows as usize * 16)?;
    let cols = cols.min(width) as usize;
    data.par_chunks_exact_mut(width as usize * 4)
        .take(rows as usize)
        .for_each(|row| {
            for px in row.chunks_exact_mut(4).take(cols) {
                px[0] = 1.0 - px[0];
                px[1] = 1.0 - px[1];
                px[2] = 1.0 - px[2];
            }
        });
    Ok(())
}

/// Writes BGRA8 bytes for the first `cols x rows` pixels.
pub(crate) fn bgra8_region<F>(out: &mut [u8], width: u32, cols: u32, rows: u32, load: F) -> ComputeResult<()>
where
    F: Fn(u32, u32) -> [f32; 4] + Sync,
{
    check_destination(out.len(), width as usize * rows as usize * 4)?;
    let cols = cols.min(width);
    out.par_chunks_exact_mut(width as usize * 4)
        .take(rows as usize)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..cols {
                let i = x as usize * 4;
                row[i..i + 4].copy_from_slice(&bgra8_pixel(load(x, y as u32)));
            }
        });
    Ok(())
}

/// Writes P216 luma and chroma for the first `pairs` pixel pairs of the
/// first `rows` rows. `out` starts at the luma plane; the chroma plane
/// follows `width * height * 2` bytes later.
///
/// On odd widths the last pixel pairs with itself and only its Y0 and Cb
/// samples fit in the row.
pub(crate) fn p216_region<F>(
    out: &mut [u8],
    width: u32,
    height: u32,
    pairs: u32,
    rows: u32,
    load: F,
) -> ComputeResult<()>
where
    F: Fn(u32, u32) -> [f32; 4] + Sync,
{
    let row_bytes = width as usize * 2;
    let plane = row_bytes * height as usize;
    check_destination(out.len(), plane * 2)?;
    let pairs = pairs.min(width.div_ceil(2));
    let (luma, chroma) = out[..plane * 2].split_at_mut(plane);
    luma.par_chunks_exact_mut(row_bytes)
        .zip(chroma.par_chunks_exact_mut(row_bytes))
        .take(rows as usize)
        .enumerate()
        .for_each(|(y, (luma_row, chroma_row))| {
            let y = y as u32;
            for px in 0..pairs {
                let x = 2 * px;
                let p0 = load(x, y);
                let p1 = if x + 1 < width { load(x + 1, y) } else { p0 };
                let ([y0, y1], [cb, cr]) = rgba_pair_to_p216(p0, p1);
                let i = px as usize * 4;
                put_sample(luma_row, i, y0);
                put_sample(luma_row, i + 2, y1);
                put_sample(chroma_row, i, cb);
                put_sample(chroma_row, i + 2, cr);
            }
        });
    Ok(())
}

#[inline]
fn put_sample(row: &mut [u8], at: usize, sample: u16) {
    if let Some(dst) = row.get_mut(at..at + 2) {
        dst.copy_from_slice(&sample.to_le_bytes());
    }
}

/// Inverts the colour channels of an RGBA image; alpha is kept.
pub fn invert_rgba(src: &[f32], width: u32, height: u32) -> ComputeResult<Vec<f32>> {
    check_source(src, width, height)?;
    let mut out = src.to_vec();
    invert_region(&mut out, width, width, height)?;
    Ok(out)
}

/// Quantises an RGBA image to BGRA8.
pub fn rgba_to_bgra8(src: &[f32], width: u32, height: u32) -> ComputeResult<Vec<u8>> {
    convert(OutputFormat::Bgra8, src, width, height)
}

/// Converts an RGBA image to P216 (BT.709, 10-bit in 16-bit, 4:2:2).
pub fn rgba_to_p216(src: &[f32], width: u32, height: u32) -> ComputeResult<Vec<u8>> {
    convert(OutputFormat::P216, src, width, height)
}

/// Converts an RGBA image to `format`.
pub fn convert(format: OutputFormat, src: &[f32], width: u32, height: u32) -> ComputeResult<Vec<u8>> {
    let layout = format.layout(width, height)?;
    check_source(src, width, height)?;
    let mut out = vec![0u8; layout.total_bytes];
    let load = |x, y| load_packed(src, width, x, y);
    match format {
        OutputFormat::Bgra8 => bgra8_region(&mut out, width, width, height, load)?,
        OutputFormat::P216 => p216_region(&mut out, width, height, width.div_ceil(2), height, load)?,
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_invert_keeps_alpha() {
        let out = invert_rgba(&[0.25, 0.5, 1.0, 0.3], 1, 1).unwrap();
        assert_abs_diff_eq!(out[0], 0.75);
        assert_abs_diff_eq!(out[1], 0.5);
        assert_abs_diff_eq!(out[2], 0.0);
        assert_abs_diff_eq!(out[3], 0.3);
    }

    #[test]
    fn test_white_bgra() {
        let out = rgba_to_bgra8(&[1.0; 16], 2, 2).unwrap();
        assert_eq!(out, vec![255u8; 16]);
    }

    #[test]
    fn test_bgra_byte_order() {
        let out = rgba_to_bgra8(&[1.0, 0.0, 0.5, 0.0], 1, 1).unwrap();
        assert_eq!(out, vec![128, 0, 255, 0]);
    }

    #[test]
    fn test_p216_black_and_white() {
        // One black and one white pixel: luma 64 / 940, chroma neutral.
        let src = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let out = rgba_to_p216(&src, 2, 1).unwrap();
        let samples: Vec<u16> = out.chunks_exact(2).map(|b| u16::from_le_bytes([b[0], b[1]])).collect();
        assert_eq!(samples, vec![64 << 6, 940 << 6, 512 << 6, 512 << 6]);
    }

    #[test]
    fn test_p216_plane_split() {
        let src = vec![0.5f32; 4 * 3 * 4];
        let out = rgba_to_p216(&src, 4, 3).unwrap();
        assert_eq!(out.len(), 4 * 3 * 4);
        let (luma, chroma) = out.split_at(4 * 3 * 2);
        assert!(luma.chunks_exact(2).all(|b| *b == luma[..2]));
        assert!(chroma.chunks_exact(4).all(|b| *b == chroma[..4]));
    }

    #[test]
    fn test_p216_odd_width_pairs_last_pixel_with_itself() {
        // Black, white, white: the third pixel has no partner.
        let src = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let out = rgba_to_p216(&src, 3, 1).unwrap();
        assert_eq!(out.len(), 12);
        let samples: Vec<u16> = out.chunks_exact(2).map(|b| u16::from_le_bytes([b[0], b[1]])).collect();
        let (grey_cb, grey_cr) = (samples[3], samples[4]);
        assert_eq!(samples[..3], [64 << 6, 940 << 6, 940 << 6]);
        // First pair averages black and white; the lone white pixel keeps Cb only.
        assert_eq!((grey_cb, grey_cr), (512 << 6, 512 << 6));
        assert_eq!(samples[5], 512 << 6);
    }

    #[test]
    fn test_short_destination_is_an_error() {
        let mut out = vec![0u8; 4 * 2 * 2];
        let err = p216_region(&mut out, 4, 2, 2, 2, |_, _| [1.0; 4]).unwrap_err();
        assert!(matches!(err, ComputeError::BufferSizeMismatch { expected: 32, actual: 16 }));
        assert!(out.iter().all(|b| *b == 0));

        let mut out = vec![0u8; 4];
        assert!(bgra8_region(&mut out, 2, 2, 1, |_, _| [1.0; 4]).is_err());
        let mut data = vec![0.0f32; 4];
        assert!(invert_region(&mut data, 2, 2, 1).is_err());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(rgba_to_bgra8(&[0.0; 3], 1, 1), Err(ComputeError::BufferSizeMismatch { .. })));
        assert!(matches!(rgba_to_p216(&[0.0; 4], 0, 1), Err(ComputeError::Core(_))));
        assert!(matches!(invert_rgba(&[], 0, 1), Err(ComputeError::InvalidDimensions(0, 1))));
    }
}
