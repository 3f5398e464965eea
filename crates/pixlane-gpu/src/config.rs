//! Context configuration.
//!
//! # Environment Variables
//!
//! - `PIXLANE_BACKEND` - Comma-separated backend priority list (`native,alternate,cpu`, `auto`)
//! - `PIXLANE_CPU_THREADS` - Worker threads for the CPU backend (default: all cores)
//! - `PIXLANE_POWER` - GPU adapter preference (`high` or `low`)
//! - `PIXLANE_GPU_MEMORY_MB` - Override the reported GPU memory size

use std::env;

use tracing::warn;

use crate::Backend;

/// GPU adapter preference when several are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerPreference {
    /// Prefer discrete GPUs.
    #[default]
    HighPerformance,
    /// Prefer integrated GPUs.
    LowPower,
}

/// Configuration for [`ComputeContext`](crate::ComputeContext) and
/// [`Device::with_config`](crate::Device::with_config).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Backends to try, in priority order.
    pub backends: Vec<Backend>,
    pub power: PowerPreference,
    /// CPU backend worker threads; `None` uses one per core.
    pub cpu_threads: Option<usize>,
    /// Debug label attached to devices and queues.
    pub label: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            backends: Backend::Auto.candidates().to_vec(),
            power: PowerPreference::default(),
            cpu_threads: None,
            label: "pixlane".into(),
        }
    }
}

impl ContextConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(list) = lookup("PIXLANE_BACKEND") {
            match parse_backend_list(&list) {
                Some(backends) => config.backends = backends,
                None => warn!(value = %list, "ignoring invalid PIXLANE_BACKEND"),
            }
        }

        if let Some(threads) = lookup("PIXLANE_CPU_THREADS") {
            match threads.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.cpu_threads = Some(n),
                _ => warn!(value = %threads, "ignoring invalid PIXLANE_CPU_THREADS"),
            }
        }

        if let Some(power) = lookup("PIXLANE_POWER") {
            match power.trim().to_ascii_lowercase().as_str() {
                "high" | "high-performance" => config.power = PowerPreference::HighPerformance,
                "low" | "low-power" => config.power = PowerPreference::LowPower,
                _ => warn!(value = %power, "ignoring invalid PIXLANE_POWER"),
            }
        }

        config
    }

    /// Use exactly one backend.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backends = backend.candidates().to_vec();
        self
    }

    /// Use the given priority list.
    pub fn backends(mut self, backends: impl IntoIterator<Item = Backend>) -> Self {
        self.backends = backends.into_iter().flat_map(|b| b.candidates().iter().copied()).collect();
        self
    }

    pub fn power(mut self, power: PowerPreference) -> Self {
        self.power = power;
        self
    }

    pub fn cpu_threads(mut self, threads: usize) -> Self {
        self.cpu_threads = Some(threads.max(1));
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Parses `native,alternate,cpu`. `None` if any entry is unknown or the list is empty.
fn parse_backend_list(list: &str) -> Option<Vec<Backend>> {
    let mut out: Vec<Backend> = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let backend: Backend = item.parse().ok()?;
        for b in backend.candidates() {
            if !out.contains(b) {
                out.push(*b);
            }
        }
    }
    (!out.is_empty()).then_some(out)
}

/// Reported GPU memory override in bytes.
pub(crate) fn gpu_memory_override() -> Option<u64> {
    env::var("PIXLANE_GPU_MEMORY_MB")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|mb| mb.saturating_mul(1024 * 1024))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| v.to_string())
    }

    #[test]
    fn test_default_priority() {
        let config = ContextConfig::default();
        assert_eq!(config.backends, vec![Backend::NativeGpu, Backend::AlternateGpu, Backend::Cpu]);
    }

    #[test]
    fn test_env_overrides() {
        let config = ContextConfig::from_lookup(lookup(&[
            ("PIXLANE_BACKEND", "alternate, cpu"),
            ("PIXLANE_CPU_THREADS", "3"),
            ("PIXLANE_POWER", "low"),
        ]));
        assert_eq!(config.backends, vec![Backend::AlternateGpu, Backend::Cpu]);
        assert_eq!(config.cpu_threads, Some(3));
        assert_eq!(config.power, PowerPreference::LowPower);
    }

    #[test]
    fn test_invalid_env_ignored() {
        let config = ContextConfig::from_lookup(lookup(&[
            ("PIXLANE_BACKEND", "cuda"),
            ("PIXLANE_CPU_THREADS", "0"),
        ]));
        assert_eq!(config, ContextConfig::default());
    }

    #[test]
    fn test_auto_expands_without_duplicates() {
        let config = ContextConfig::from_lookup(lookup(&[("PIXLANE_BACKEND", "cpu,auto")]));
        assert_eq!(config.backends, vec![Backend::Cpu, Backend::NativeGpu, Backend::AlternateGpu]);
    }

    #[test]
    fn test_builder() {
        let config = ContextConfig::default().backend(Backend::Cpu).cpu_threads(2).label("test");
        assert_eq!(config.backends, vec![Backend::Cpu]);
        assert_eq!(config.cpu_threads, Some(2));
        assert_eq!(config.label, "test");
    }
}
