//! Host capability snapshot.
//!
//! [`SystemState`] is built once at startup and shared behind an `Arc`. It
//! answers one question for the gallery and the runtime: which variant of a
//! meta-backend belongs on this machine.
//!
//! # Example
//!
//! ```rust,no_run
//! use localai_core::system::SystemState;
//! use std::collections::HashMap;
//!
//! let state = SystemState::builder("/models", "/backends").detect();
//! let mut variants = HashMap::new();
//! variants.insert("nvidia".to_string(), "cuda12-llama-cpp".to_string());
//! variants.insert("default".to_string(), "cpu-llama-cpp".to_string());
//! println!("{:?}", state.capability_value(&variants));
//! ```

mod capability;
mod gpu;

pub use capability::{
    is_backend_compatible, preference_tokens, resolve_capability, CapabilityInputs,
    DEFAULT_CAPABILITY, MIN_VRAM_BYTES,
};
pub use gpu::{
    primary_gpu, system_gpus, CompositeProbe, GpuInfo, GpuProbe, GpuVendor, NvidiaSmiProbe,
    RocmSmiProbe, StaticProbe, SysfsProbe,
};

use crate::config::{EnvVars, PathsConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Immutable snapshot of host capability and configured paths.
#[derive(Debug, Clone)]
pub struct SystemState {
    gpu_vendor: GpuVendor,
    vram_bytes: u64,
    os: String,
    arch: String,
    capability: String,
    models_path: PathBuf,
    backends_path: PathBuf,
    backends_system_path: Option<PathBuf>,
}

impl SystemState {
    pub fn builder(
        models_path: impl Into<PathBuf>,
        backends_path: impl Into<PathBuf>,
    ) -> SystemStateBuilder {
        SystemStateBuilder::new(models_path, backends_path)
    }

    pub fn gpu_vendor(&self) -> GpuVendor {
        self.gpu_vendor
    }

    pub fn vram_bytes(&self) -> u64 {
        self.vram_bytes
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn models_path(&self) -> &Path {
        &self.models_path
    }

    pub fn backends_path(&self) -> &Path {
        &self.backends_path
    }

    pub fn backends_system_path(&self) -> Option<&Path> {
        self.backends_system_path.as_deref()
    }

    /// The resolved capability string for this host.
    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Look up the capability in `map`, falling back to the `default` entry
    /// when the host's key is missing or empty.
    pub fn capability_value<'a>(&self, map: &'a HashMap<String, String>) -> Option<&'a str> {
        let lookup = |key: &str| map.get(key).map(String::as_str).filter(|v| !v.is_empty());
        lookup(&self.capability).or_else(|| lookup(DEFAULT_CAPABILITY))
    }

    pub fn preference_tokens(&self) -> &'static [&'static str] {
        preference_tokens(&self.capability)
    }

    pub fn is_backend_compatible(&self, name: &str, uri: &str) -> bool {
        is_backend_compatible(&self.capability, name, uri)
    }
}

/// Builder for [`SystemState`].
///
/// `detect()` probes the host; the `gpu`, `platform` and `capability`
/// setters pin values instead, which is how tests simulate other machines.
pub struct SystemStateBuilder {
    models_path: PathBuf,
    backends_path: PathBuf,
    backends_system_path: Option<PathBuf>,
    gpu: Option<(GpuVendor, u64)>,
    platform: Option<(String, String)>,
    capability: Option<String>,
    read_environment: bool,
}

impl SystemStateBuilder {
    pub fn new(models_path: impl Into<PathBuf>, backends_path: impl Into<PathBuf>) -> Self {
        Self {
            models_path: models_path.into(),
            backends_path: backends_path.into(),
            backends_system_path: None,
            gpu: None,
            platform: None,
            capability: None,
            read_environment: true,
        }
    }

    pub fn backends_system_path(mut self, path: Option<PathBuf>) -> Self {
        self.backends_system_path = path;
        self
    }

    /// Pin the GPU instead of probing for it.
    pub fn gpu(mut self, vendor: GpuVendor, vram_bytes: u64) -> Self {
        self.gpu = Some((vendor, vram_bytes));
        self
    }

    /// Pin the platform (`std::env::consts::OS`, `ARCH` spelling).
    pub fn platform(mut self, os: impl Into<String>, arch: impl Into<String>) -> Self {
        self.platform = Some((os.into(), arch.into()));
        self
    }

    /// Force the capability, bypassing detection entirely.
    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    /// Ignore the force-capability environment variable and run file.
    pub fn ignore_environment(mut self) -> Self {
        self.read_environment = false;
        self
    }

    /// Probe whatever was not pinned and build the snapshot.
    pub fn detect(self) -> SystemState {
        let (gpu_vendor, vram_bytes) = self
            .gpu
            .unwrap_or_else(|| primary_gpu(&system_gpus()));
        let (os, arch) = self.platform.unwrap_or_else(|| {
            (
                std::env::consts::OS.to_string(),
                std::env::consts::ARCH.to_string(),
            )
        });

        let capability = match self.capability {
            Some(capability) => capability,
            None => {
                let (forced, run_file) = if self.read_environment {
                    (
                        std::env::var(EnvVars::FORCE_CAPABILITY).ok(),
                        read_capability_run_file(),
                    )
                } else {
                    (None, None)
                };
                resolve_capability(&CapabilityInputs {
                    forced,
                    run_file,
                    os: os.clone(),
                    arch: arch.clone(),
                    gpu_vendor,
                    vram_bytes,
                })
            }
        };

        info!(
            capability = %capability,
            gpu_vendor = %gpu_vendor,
            vram_bytes,
            "Detected system capability"
        );

        SystemState {
            gpu_vendor,
            vram_bytes,
            os,
            arch,
            capability,
            models_path: self.models_path,
            backends_path: self.backends_path,
            backends_system_path: self.backends_system_path,
        }
    }
}

fn read_capability_run_file() -> Option<String> {
    let path = std::env::var(EnvVars::CAPABILITY_RUN_FILE)
        .unwrap_or_else(|_| PathsConfig::DEFAULT_CAPABILITY_RUN_FILE.to_string());
    match std::fs::read_to_string(&path) {
        Ok(contents) => Some(contents),
        Err(e) => {
            debug!("No capability run file at {}: {}", path, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(vendor: GpuVendor, vram_gib: u64) -> SystemState {
        SystemState::builder("/models", "/backends")
            .gpu(vendor, vram_gib * 1024 * 1024 * 1024)
            .platform("linux", "x86_64")
            .ignore_environment()
            .detect()
    }

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_capability_value_prefers_host_key() {
        let variants = map(&[("nvidia", "llama-cuda"), ("default", "llama-cpu")]);
        assert_eq!(state(GpuVendor::Nvidia, 24).capability_value(&variants), Some("llama-cuda"));
        assert_eq!(state(GpuVendor::Amd, 24).capability_value(&variants), Some("llama-cpu"));
    }

    #[test]
    fn test_capability_value_empty_host_entry_uses_default() {
        let variants = map(&[("nvidia", ""), ("default", "llama-cpu")]);
        assert_eq!(state(GpuVendor::Nvidia, 24).capability_value(&variants), Some("llama-cpu"));
    }

    #[test]
    fn test_capability_value_unresolvable() {
        let variants = map(&[("nvidia", "llama-cuda")]);
        assert_eq!(state(GpuVendor::None, 0).capability_value(&variants), None);
        let empty = map(&[("nvidia", ""), ("default", "")]);
        assert_eq!(state(GpuVendor::Nvidia, 24).capability_value(&empty), None);
    }

    #[test]
    fn test_capability_key() {
        let variants = map(&[("amd", "x")]);
        assert_eq!(state(GpuVendor::Amd, 8).capability_key(&variants), "amd");
        assert_eq!(state(GpuVendor::Nvidia, 8).capability_key(&variants), "default");
    }

    #[test]
    fn test_forced_capability_override() {
        let state = SystemState::builder("/m", "/b")
            .gpu(GpuVendor::None, 0)
            .capability("intel")
            .detect();
        assert_eq!(state.capability(), "intel");
        assert_eq!(state.preference_tokens(), &["sycl", "intel", "cpu"]);
        assert!(state.is_backend_compatible("intel-sycl-f16-llama-cpp", ""));
    }
}
