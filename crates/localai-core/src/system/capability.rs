//! Host capability resolution.
//!
//! A capability is the key used to pick a concrete backend out of a
//! meta-backend's `capabilities` map: `nvidia`, `amd`, `intel`, `metal`,
//! `darwin-x86`, `nvidia-l4t` or `default`.

use super::gpu::GpuVendor;

pub const DEFAULT_CAPABILITY: &str = "default";
pub const METAL: &str = "metal";
pub const DARWIN_X86: &str = "darwin-x86";
pub const NVIDIA_L4T: &str = "nvidia-l4t";

/// Cards at or below this size are not worth a GPU backend.
pub const MIN_VRAM_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Everything capability detection depends on, gathered up front.
#[derive(Debug, Clone, Default)]
pub struct CapabilityInputs {
    /// Value of the force-capability environment variable.
    pub forced: Option<String>,
    /// Contents of the capability run file, if it exists.
    pub run_file: Option<String>,
    pub os: String,
    pub arch: String,
    pub gpu_vendor: GpuVendor,
    pub vram_bytes: u64,
}

/// Resolve the capability, highest precedence first.
pub fn resolve_capability(inputs: &CapabilityInputs) -> String {
    if let Some(forced) = non_empty(inputs.forced.as_deref()) {
        return forced.to_string();
    }
    if let Some(declared) = non_empty(inputs.run_file.as_deref()) {
        return declared.to_string();
    }

    match (inputs.os.as_str(), inputs.arch.as_str()) {
        ("macos", "aarch64") => return METAL.to_string(),
        ("macos", "x86_64") => return DARWIN_X86.to_string(),
        ("linux", "aarch64") if inputs.gpu_vendor == GpuVendor::Nvidia => {
            return NVIDIA_L4T.to_string()
        }
        _ => {}
    }

    if inputs.gpu_vendor == GpuVendor::None || inputs.vram_bytes <= MIN_VRAM_BYTES {
        return DEFAULT_CAPABILITY.to_string();
    }
    inputs.gpu_vendor.as_str().to_string()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Ordered backend-name tokens preferred on a host with `capability`.
pub fn preference_tokens(capability: &str) -> &'static [&'static str] {
    let capability = capability.to_lowercase();
    if capability.starts_with("nvidia") {
        &["cuda", "vulkan", "cpu"]
    } else if capability.starts_with("amd") {
        &["rocm", "hip", "vulkan", "cpu"]
    } else if capability.starts_with("intel") {
        &["sycl", "intel", "cpu"]
    } else if capability == METAL {
        &["metal", "cpu"]
    } else if capability == DARWIN_X86 {
        &["darwin-x86", "cpu"]
    } else if capability == "vulkan" {
        &["vulkan", "cpu"]
    } else {
        &["cpu"]
    }
}

/// Whether a backend named `name` served from `uri` can run on `capability`.
///
/// Backends that carry no accelerator marker are compatible everywhere.
pub fn is_backend_compatible(capability: &str, name: &str, uri: &str) -> bool {
    let combined = format!("{} {}", name, uri).to_lowercase();
    let capability = capability.to_lowercase();

    if ["darwin", "mlx", "metal"].iter().any(|t| combined.contains(t)) {
        return capability == METAL || capability == DARWIN_X86;
    }
    if combined.contains("l4t") {
        return capability.starts_with(NVIDIA_L4T);
    }
    if combined.contains("cuda") || combined.contains("nvidia") {
        return capability.starts_with("nvidia");
    }
    if ["rocm", "hip", "amd"].iter().any(|t| combined.contains(t)) {
        return capability.starts_with("amd");
    }
    if combined.contains("sycl") || combined.contains("intel") {
        return capability.starts_with("intel");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux_x86(vendor: GpuVendor, vram_gib: u64) -> CapabilityInputs {
        CapabilityInputs {
            os: "linux".into(),
            arch: "x86_64".into(),
            gpu_vendor: vendor,
            vram_bytes: vram_gib * 1024 * 1024 * 1024,
            ..Default::default()
        }
    }

    #[test]
    fn test_forced_capability_wins() {
        let mut inputs = linux_x86(GpuVendor::Nvidia, 24);
        inputs.forced = Some("intel".into());
        inputs.run_file = Some("amd".into());
        assert_eq!(resolve_capability(&inputs), "intel");
    }

    #[test]
    fn test_run_file_is_trimmed() {
        let mut inputs = linux_x86(GpuVendor::None, 0);
        inputs.run_file = Some("nvidia\n".into());
        assert_eq!(resolve_capability(&inputs), "nvidia");

        inputs.run_file = Some("  \n".into());
        assert_eq!(resolve_capability(&inputs), "default");
    }

    #[test]
    fn test_platform_shortcuts() {
        let mut inputs = CapabilityInputs {
            os: "macos".into(),
            arch: "aarch64".into(),
            ..Default::default()
        };
        assert_eq!(resolve_capability(&inputs), "metal");

        inputs.arch = "x86_64".into();
        assert_eq!(resolve_capability(&inputs), "darwin-x86");

        let jetson = CapabilityInputs {
            os: "linux".into(),
            arch: "aarch64".into(),
            gpu_vendor: GpuVendor::Nvidia,
            vram_bytes: 0,
            ..Default::default()
        };
        assert_eq!(resolve_capability(&jetson), "nvidia-l4t");
    }

    #[test]
    fn test_vram_threshold() {
        assert_eq!(resolve_capability(&linux_x86(GpuVendor::Nvidia, 24)), "nvidia");
        assert_eq!(resolve_capability(&linux_x86(GpuVendor::Amd, 16)), "amd");
        assert_eq!(resolve_capability(&linux_x86(GpuVendor::Intel, 4)), "default");
        assert_eq!(resolve_capability(&linux_x86(GpuVendor::None, 64)), "default");
    }

    #[test]
    fn test_preference_tokens() {
        assert_eq!(preference_tokens("nvidia"), &["cuda", "vulkan", "cpu"]);
        assert_eq!(preference_tokens("nvidia-l4t"), &["cuda", "vulkan", "cpu"]);
        assert_eq!(preference_tokens("amd"), &["rocm", "hip", "vulkan", "cpu"]);
        assert_eq!(preference_tokens("default"), &["cpu"]);
    }

    #[test]
    fn test_backend_compatibility() {
        assert!(is_backend_compatible("nvidia", "cuda12-llama-cpp", ""));
        assert!(!is_backend_compatible("default", "cuda12-llama-cpp", ""));
        assert!(!is_backend_compatible("nvidia", "rocm-llama-cpp", ""));
        assert!(is_backend_compatible("metal", "metal-llama-cpp", ""));
        assert!(!is_backend_compatible("amd", "mlx", ""));
        assert!(is_backend_compatible(
            "default",
            "cpu-whisper",
            "oci://quay.io/go-skynet/local-ai-backends:latest-cpu-whisper"
        ));
        assert!(!is_backend_compatible("nvidia", "llama-cpp", "oci://x/y:l4t-llama"));
    }
}
