//! Backend probing for diagnostics and auto-selection.
//!
//! The order comes from [`Backend::Auto`]'s candidate list, the same list
//! `ComputeContext` walks when it opens a device.

use super::Backend;

/// One probed backend.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub backend: Backend,
    /// Position-derived rank; the first `Auto` candidate ranks highest.
    pub priority: u32,
    /// Result of [`Backend::is_available`] at probe time.
    pub available: bool,
    pub description: &'static str,
}

fn description(backend: Backend) -> &'static str {
    match backend {
        Backend::NativeGpu => "GPU via wgpu (Vulkan/Metal/DX12)",
        Backend::AlternateGpu => "GPU via wgpu (OpenGL/GLES)",
        Backend::Cpu => "CPU host kernels on a rayon pool",
        Backend::Auto => "first available of the above",
    }
}

/// Probes every concrete backend, in auto-selection order.
pub fn detect_backends() -> Vec<BackendInfo> {
    let order = Backend::Auto.candidates();
    order
        .iter()
        .enumerate()
        .map(|(i, &backend)| BackendInfo {
            backend,
            priority: (order.len() - i) as u32,
            available: backend.is_available(),
            description: description(backend),
        })
        .collect()
}

/// First available backend in auto-selection order. The CPU backend is
/// always available, so this never fails.
pub fn select_best_backend() -> Backend {
    Backend::Auto
        .candidates()
        .iter()
        .copied()
        .find(Backend::is_available)
        .unwrap_or(Backend::Cpu)
}

/// One line per backend: `[+] native: ...` when available, `[-]` otherwise.
pub fn describe_backends() -> String {
    detect_backends()
        .iter()
        .map(|info| {
            let status = if info.available { '+' } else { '-' };
            format!("[{status}] {}: {}\n", info.backend.name(), info.description)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_always_listed() {
        let backends = detect_backends();
        assert!(backends.iter().any(|b| b.backend == Backend::Cpu && b.available));
    }

    #[test]
    fn test_detection_follows_auto_order() {
        let backends: Vec<_> = detect_backends().iter().map(|b| b.backend).collect();
        assert_eq!(backends, Backend::Auto.candidates());
        assert!(detect_backends().windows(2).all(|w| w[0].priority > w[1].priority));
    }

    #[test]
    fn test_best_is_first_available() {
        let best = select_best_backend();
        let first = detect_backends().into_iter().find(|b| b.available).map(|b| b.backend);
        assert_eq!(Some(best), first);
    }
}
