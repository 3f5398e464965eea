//! Pixel quantisation and BT.709 helpers.
//!
//! These are the exact numerics of the conversion kernels. The WGSL kernels
//! spell the same formulas, the CPU backend and the reference path call
//! these functions directly.
//!
//! # 8-bit
//!
//! `byte = floor(clamp(v, 0, 1) * 255 + 0.5)`.
//!
//! # 10-bit 4:2:2 (P216)
//!
//! BT.709 limited ("video") range:
//!
//! | Component | Formula                       | Range      |
//! |-----------|-------------------------------|------------|
//! | Y         | `64 + 876 * Y'`               | 64..=940   |
//! | Cb, Cr    | `512 + 896 * C'`              | 64..=960   |
//!
//! Codes are stored MSB-aligned in 16-bit containers (`code << 6`), which is
//! how P216/P210 consumers expect 10-bit content.
//!
//! Rounding is `floor(x + 0.5)` everywhere so GPU and host agree on ties.

use half::f16;

use crate::format::TextureFormat;

/// BT.709 red luma coefficient.
pub const KR: f32 = 0.2126;
/// BT.709 green luma coefficient.
pub const KG: f32 = 0.7152;
/// BT.709 blue luma coefficient.
pub const KB: f32 = 0.0722;

/// Limited-range luma black level (10-bit).
pub const LUMA_OFFSET: f32 = 64.0;
/// Limited-range luma excursion (10-bit).
pub const LUMA_RANGE: f32 = 876.0;
/// Chroma zero level (10-bit).
pub const CHROMA_OFFSET: f32 = 512.0;
/// Chroma excursion (10-bit).
pub const CHROMA_RANGE: f32 = 896.0;

/// Left shift placing a 10-bit code in the high bits of a 16-bit sample.
pub const P216_SHIFT: u32 = 6;

#[inline]
fn round_half_up(x: f32) -> f32 {
    (x + 0.5).floor()
}

/// Quantises a normalized float to an 8-bit code.
///
/// NaN maps to 0.
#[inline]
pub fn unorm8(v: f32) -> u8 {
    round_half_up(v.clamp(0.0, 1.0) * 255.0) as u8
}

/// Quantises one RGBA pixel to BGRA byte order.
#[inline]
pub fn rgba_to_bgra8(px: [f32; 4]) -> [u8; 4] {
    [unorm8(px[2]), unorm8(px[1]), unorm8(px[0]), unorm8(px[3])]
}

/// BGRA bytes of one pixel packed into a little-endian word, as the GPU
/// kernels write them.
#[inline]
pub fn rgba_to_bgra8_word(px: [f32; 4]) -> u32 {
    u32::from_le_bytes(rgba_to_bgra8(px))
}

/// BT.709 non-linear R'G'B' to Y'CbCr, inputs clamped to `[0, 1]`.
///
/// Returns `[Y', Cb', Cr']` with `Y'` in `[0, 1]` and chroma in
/// `[-0.5, 0.5]`.
#[inline]
pub fn ycbcr709(rgb: [f32; 3]) -> [f32; 3] {
    let r = rgb[0].clamp(0.0, 1.0);
    let g = rgb[1].clamp(0.0, 1.0);
    let b = rgb[2].clamp(0.0, 1.0);
    let y = KR * r + KG * g + KB * b;
    let cb = (b - y) / (2.0 * (1.0 - KB));
    let cr = (r - y) / (2.0 * (1.0 - KR));
    [y, cb, cr]
}

/// 10-bit limited-range luma code.
#[inline]
pub fn luma10(y: f32) -> u16 {
    round_half_up(LUMA_OFFSET + LUMA_RANGE * y.clamp(0.0, 1.0)) as u16
}

/// 10-bit limited-range chroma code.
#[inline]
pub fn chroma10(c: f32) -> u16 {
    round_half_up(CHROMA_OFFSET + CHROMA_RANGE * c.clamp(-0.5, 0.5)) as u16
}

/// MSB-aligns a 10-bit code in a 16-bit container.
#[inline]
pub const fn p216_sample(code: u16) -> u16 {
    code << P216_SHIFT
}

/// Converts a horizontal pixel pair to P216 samples.
///
/// Returns `([y0, y1], [cb, cr])`. Chroma is taken from the average RGB of
/// the pair; alpha is dropped.
pub fn rgba_pair_to_p216(p0: [f32; 4], p1: [f32; 4]) -> ([u16; 2], [u16; 2]) {
    let y0 = ycbcr709([p0[0], p0[1], p0[2]])[0];
    let y1 = ycbcr709([p1[0], p1[1], p1[2]])[0];
    let avg = [
        (p0[0].clamp(0.0, 1.0) + p1[0].clamp(0.0, 1.0)) * 0.5,
        (p0[1].clamp(0.0, 1.0) + p1[1].clamp(0.0, 1.0)) * 0.5,
        (p0[2].clamp(0.0, 1.0) + p1[2].clamp(0.0, 1.0)) * 0.5,
    ];
    let [_, cb, cr] = ycbcr709(avg);
    (
        [p216_sample(luma10(y0)), p216_sample(luma10(y1))],
        [p216_sample(chroma10(cb)), p216_sample(chroma10(cr))],
    )
}

/// Decodes one texel of `format` to RGBA floats.
///
/// Single-channel formats return `[r, 0, 0, 1]`. `bytes` must hold at least
/// [`TextureFormat::bytes_per_pixel`] bytes.
pub fn decode_texel(format: TextureFormat, bytes: &[u8]) -> [f32; 4] {
    let f32_at = |i: usize| f32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
    let f16_at = |i: usize| f16::from_le_bytes([bytes[i], bytes[i + 1]]).to_f32();
    let unorm = |b: u8| b as f32 / 255.0;
    match format {
        TextureFormat::Rgba8Unorm => [unorm(bytes[0]), unorm(bytes[1]), unorm(bytes[2]), unorm(bytes[3])],
        TextureFormat::Bgra8Unorm => [unorm(bytes[2]), unorm(bytes[1]), unorm(bytes[0]), unorm(bytes[3])],
        TextureFormat::Rgba16Float => [f16_at(0), f16_at(2), f16_at(4), f16_at(6)],
        TextureFormat::Rgba32Float => [f32_at(0), f32_at(4), f32_at(8), f32_at(12)],
        TextureFormat::R32Float => [f32_at(0), 0.0, 0.0, 1.0],
    }
}

/// Encodes RGBA floats into one texel of `format`.
///
/// `out` must hold at least [`TextureFormat::bytes_per_pixel`] bytes.
pub fn encode_texel(format: TextureFormat, rgba: [f32; 4], out: &mut [u8]) {
    match format {
        TextureFormat::Rgba8Unorm => {
            for (o, v) in out.iter_mut().zip(rgba) {
                *o = unorm8(v);
            }
        }
        TextureFormat::Bgra8Unorm => out[..4].copy_from_slice(&rgba_to_bgra8(rgba)),
        TextureFormat::Rgba16Float => {
            for (i, v) in rgba.into_iter().enumerate() {
                out[i * 2..i * 2 + 2].copy_from_slice(&f16::from_f32(v).to_le_bytes());
            }
        }
        TextureFormat::Rgba32Float => {
            for (i, v) in rgba.into_iter().enumerate() {
                out[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
            }
        }
        TextureFormat::R32Float => out[..4].copy_from_slice(&rgba[0].to_le_bytes()),
    }
}
