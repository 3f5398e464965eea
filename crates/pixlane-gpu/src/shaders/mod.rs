//! WGSL sources of the built-in kernels.
//!
//! Every entry point here has a host kernel of the same name in
//! `backend::builtins`. Images are RGBA `f32` (`array<vec4<f32>>`), and
//! `dims` is `(width, height, 0, 0)`.

/// In-place RGB inversion, alpha kept.
pub const INVERT_KERNEL: &str = r#"
@group(0) @binding(0) var<storage, read_write> pixels: array<vec4<f32>>;
@group(0) @binding(1) var<uniform> dims: vec4<u32>;

@compute @workgroup_size(16, 16, 1)
fn invert_rgba(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x >= dims.x || id.y >= dims.y {
        return;
    }
    let i = id.y * dims.x + id.x;
    let px = pixels[i];
    pixels[i] = vec4<f32>(vec3<f32>(1.0) - px.rgb, px.a);
}
"#;

/// BGRA8 and P216 output kernels, from a buffer or a texture.
///
/// BGRA8: one thread per pixel, one `u32` (B, G, R, A bytes) per pixel.
/// P216: one thread per horizontal pixel pair. Luma word `y * pairs + x`
/// holds `Y0 | Y1 << 16`; chroma word `height * pairs + y * pairs + x`
/// holds `Cb | Cr << 16`. Samples are 10-bit codes shifted left by 6.
/// On odd widths rows straddle words, so samples are stored one halfword
/// at a time, and the last pixel of a row keeps only its Y0 and Cb.
pub const CONVERT_KERNELS: &str = r#"
@group(0) @binding(0) var<storage, read> src: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read_write> dst: array<atomic<u32>>;
@group(0) @binding(2) var<uniform> dims: vec4<u32>;
@group(1) @binding(0) var image: texture_2d<f32>;

const KR: f32 = 0.2126;
const KG: f32 = 0.7152;
const KB: f32 = 0.0722;

fn unorm8(v: f32) -> u32 {
    return u32(floor(clamp(v, 0.0, 1.0) * 255.0 + 0.5));
}

fn pack_bgra8(px: vec4<f32>) -> u32 {
    return unorm8(px.b) | (unorm8(px.g) << 8u) | (unorm8(px.r) << 16u) | (unorm8(px.a) << 24u);
}

fn luma(rgb: vec3<f32>) -> f32 {
    let c = clamp(rgb, vec3<f32>(0.0), vec3<f32>(1.0));
    return KR * c.r + KG * c.g + KB * c.b;
}

fn luma_sample(rgb: vec3<f32>) -> u32 {
    return u32(floor(64.0 + 876.0 * luma(rgb) + 0.5)) << 6u;
}

fn chroma_sample(c: f32) -> u32 {
    return u32(floor(512.0 + 896.0 * clamp(c, -0.5, 0.5) + 0.5)) << 6u;
}

fn chroma_pair(a: vec3<f32>, b: vec3<f32>) -> u32 {
    let rgb = (clamp(a, vec3<f32>(0.0), vec3<f32>(1.0)) + clamp(b, vec3<f32>(0.0), vec3<f32>(1.0))) * 0.5;
    let y = KR * rgb.r + KG * rgb.g + KB * rgb.b;
    let cb = (rgb.b - y) / (2.0 * (1.0 - KB));
    let cr = (rgb.r - y) / (2.0 * (1.0 - KR));
    return chroma_sample(cb) | (chroma_sample(cr) << 16u);
}

// Neighbouring threads own the other half of the word.
fn store_half(index: u32, value: u32) {
    let shift = (index & 1u) * 16u;
    atomicAnd(&dst[index >> 1u], ~(0xffffu << shift));
    atomicOr(&dst[index >> 1u], value << shift);
}

fn store_p216(x: u32, y: u32, a: vec4<f32>, b: vec4<f32>) {
    let luma_word = luma_sample(a.rgb) | (luma_sample(b.rgb) << 16u);
    let chroma_word = chroma_pair(a.rgb, b.rgb);
    if dims.x % 2u == 0u {
        let pairs = dims.x / 2u;
        atomicStore(&dst[y * pairs + x], luma_word);
        atomicStore(&dst[dims.y * pairs + y * pairs + x], chroma_word);
        return;
    }
    let luma_at = y * dims.x + 2u * x;
    let chroma_at = dims.x * dims.y + luma_at;
    store_half(luma_at, luma_word & 0xffffu);
    store_half(chroma_at, chroma_word & 0xffffu);
    if 2u * x + 1u < dims.x {
        store_half(luma_at + 1u, luma_word >> 16u);
        store_half(chroma_at + 1u, chroma_word >> 16u);
    }
}

@compute @workgroup_size(16, 16, 1)
fn rgba_to_bgra8(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x >= dims.x || id.y >= dims.y {
        return;
    }
    let i = id.y * dims.x + id.x;
    atomicStore(&dst[i], pack_bgra8(src[i]));
}

@compute @workgroup_size(16, 16, 1)
fn texture_to_bgra8(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x >= dims.x || id.y >= dims.y {
        return;
    }
    atomicStore(&dst[id.y * dims.x + id.x], pack_bgra8(textureLoad(image, id.xy, 0)));
}

@compute @workgroup_size(16, 16, 1)
fn rgba_to_p216(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x >= (dims.x + 1u) / 2u || id.y >= dims.y {
        return;
    }
    let i = id.y * dims.x + 2u * id.x;
    let a = src[i];
    var b = a;
    if 2u * id.x + 1u < dims.x {
        b = src[i + 1u];
    }
    store_p216(id.x, id.y, a, b);
}

@compute @workgroup_size(16, 16, 1)
fn texture_to_p216(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x >= (dims.x + 1u) / 2u || id.y >= dims.y {
        return;
    }
    let a = textureLoad(image, vec2<u32>(2u * id.x, id.y), 0);
    var b = a;
    if 2u * id.x + 1u < dims.x {
        b = textureLoad(image, vec2<u32>(2u * id.x + 1u, id.y), 0);
    }
    store_p216(id.x, id.y, a, b);
}
"#;

/// Entry points of [`CONVERT_KERNELS`].
pub const CONVERT_ENTRY_POINTS: [&str; 4] = ["rgba_to_bgra8", "texture_to_bgra8", "rgba_to_p216", "texture_to_p216"];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::compile_wgsl;

    #[test]
    fn test_builtin_shaders_validate() {
        let (invert, _) = compile_wgsl(INVERT_KERNEL).unwrap();
        assert_eq!(invert.entry_points[0].name, "invert_rgba");

        let (convert, _) = compile_wgsl(CONVERT_KERNELS).unwrap();
        let names: Vec<_> = convert.entry_points.iter().map(|ep| ep.name.as_str()).collect();
        assert_eq!(names, CONVERT_ENTRY_POINTS);
    }

    #[test]
    fn test_every_entry_point_has_a_host_kernel() {
        let kernels = crate::backend::builtin_kernels();
        for name in CONVERT_ENTRY_POINTS.iter().chain(["invert_rgba"].iter()) {
            assert!(kernels.iter().any(|(k, _)| k == name), "missing host kernel for {name}");
        }
    }
}
