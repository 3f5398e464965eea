//! Compute backends.
//!
//! The backend set is closed: every per-backend object is an enum with one
//! variant per backend, selected once when the device is opened.

mod builtins;
mod detect;
mod kernel;
pub(crate) mod cpu;

#[cfg(feature = "wgpu")]
pub(crate) mod wgpu_backend;

pub use detect::{BackendInfo, describe_backends, detect_backends, select_best_backend};
pub use kernel::{BufferSlots, HostKernel, KernelArgs, TexelView, TexelViewMut, TextureSlots};

pub(crate) use builtins::builtin_kernels;

use std::str::FromStr;

use crate::command::Submission;

/// Available compute backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// First available of native GPU, alternate GPU, CPU.
    #[default]
    Auto,
    /// wgpu on the platform's primary API (Vulkan / Metal / DX12).
    NativeGpu,
    /// wgpu on the secondary API (OpenGL / GLES).
    AlternateGpu,
    /// Host kernels on a rayon pool.
    Cpu,
}

impl Backend {
    /// Concrete backends this selector stands for, in priority order.
    pub fn candidates(&self) -> &'static [Backend] {
        match self {
            Self::Auto => &[Self::NativeGpu, Self::AlternateGpu, Self::Cpu],
            Self::NativeGpu => &[Self::NativeGpu],
            Self::AlternateGpu => &[Self::AlternateGpu],
            Self::Cpu => &[Self::Cpu],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::NativeGpu => "native",
            Self::AlternateGpu => "alternate",
            Self::Cpu => "cpu",
        }
    }

    /// Whether this backend can open a device on the current system.
    ///
    /// Pure probe: no device is created.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Auto => true,
            Self::Cpu => true,
            #[cfg(feature = "wgpu")]
            Self::NativeGpu | Self::AlternateGpu => wgpu_backend::is_available(*self),
            #[cfg(not(feature = "wgpu"))]
            Self::NativeGpu | Self::AlternateGpu => false,
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Self::NativeGpu | Self::AlternateGpu)
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "native" | "native-gpu" | "gpu" => Ok(Self::NativeGpu),
            "alternate" | "alternate-gpu" | "gl" => Ok(Self::AlternateGpu),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

// =============================================================================
// Per-backend queue
// =============================================================================

pub(crate) enum RawQueue {
    Cpu(cpu::CpuQueue),
    #[cfg(feature = "wgpu")]
    Wgpu(wgpu_backend::WgpuQueue),
}

impl RawQueue {
    pub(crate) fn is_alive(&self) -> bool {
        match self {
            Self::Cpu(q) => q.is_alive(),
            #[cfg(feature = "wgpu")]
            Self::Wgpu(q) => q.is_alive(),
        }
    }

    pub(crate) fn submit(&self, submission: Submission) {
        match self {
            Self::Cpu(q) => q.submit(submission),
            #[cfg(feature = "wgpu")]
            Self::Wgpu(q) => q.submit(submission),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend() {
        assert_eq!("cpu".parse::<Backend>(), Ok(Backend::Cpu));
        assert_eq!(" Native ".parse::<Backend>(), Ok(Backend::NativeGpu));
        assert_eq!("gl".parse::<Backend>(), Ok(Backend::AlternateGpu));
        assert!("cuda".parse::<Backend>().is_err());
    }

    #[test]
    fn test_auto_candidates() {
        assert_eq!(Backend::Auto.candidates(), &[Backend::NativeGpu, Backend::AlternateGpu, Backend::Cpu]);
        assert_eq!(Backend::Cpu.candidates(), &[Backend::Cpu]);
    }

    #[cfg(not(feature = "wgpu"))]
    #[test]
    fn test_gpu_unavailable_without_feature() {
        assert!(!Backend::NativeGpu.is_available());
        assert!(!Backend::AlternateGpu.is_available());
    }
}
