//! GPU enumeration.
//!
//! Probes are best-effort: a missing tool or unreadable sysfs entry yields no
//! cards rather than an error, so capability detection never fails startup.

use mini_moka::sync::Cache;
use serde::Serialize;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

/// GPU vendor as far as backend selection is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    #[default]
    #[serde(rename = "")]
    None,
}

impl GpuVendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpuVendor::Nvidia => "nvidia",
            GpuVendor::Amd => "amd",
            GpuVendor::Intel => "intel",
            GpuVendor::None => "",
        }
    }

    /// Match a vendor name case-insensitively by substring.
    pub fn from_vendor_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("nvidia") {
            GpuVendor::Nvidia
        } else if lower.contains("amd")
            || lower.contains("advanced micro devices")
            || lower.contains("ati technologies")
        {
            GpuVendor::Amd
        } else if lower.contains("intel") {
            GpuVendor::Intel
        } else {
            GpuVendor::None
        }
    }

    /// Map a PCI vendor id (as found in sysfs) to a vendor.
    pub fn from_pci_id(id: &str) -> Self {
        match id.trim().to_lowercase().as_str() {
            "0x10de" => GpuVendor::Nvidia,
            "0x1002" => GpuVendor::Amd,
            "0x8086" => GpuVendor::Intel,
            _ => GpuVendor::None,
        }
    }
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One enumerated graphics card.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GpuInfo {
    pub vendor: GpuVendor,
    pub name: Option<String>,
    /// Total VRAM in bytes, zero when unknown.
    pub vram_bytes: u64,
}

/// Source of graphics card information.
pub trait GpuProbe: Send + Sync {
    fn graphics_cards(&self) -> Vec<GpuInfo>;
}

/// NVIDIA cards via `nvidia-smi`.
pub struct NvidiaSmiProbe;

impl GpuProbe for NvidiaSmiProbe {
    fn graphics_cards(&self) -> Vec<GpuInfo> {
        let output = Command::new("nvidia-smi")
            .args(["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"])
            .output();

        match output {
            Ok(output) if output.status.success() => {
                parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                debug!(
                    "nvidia-smi returned non-zero: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
                Vec::new()
            }
            Err(e) => {
                debug!("nvidia-smi not available: {}", e);
                Vec::new()
            }
        }
    }
}

fn parse_nvidia_smi(stdout: &str) -> Vec<GpuInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split(',').map(str::trim);
            let name = parts.next().filter(|s| !s.is_empty())?;
            let memory_mib = parts.next().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
            Some(GpuInfo {
                vendor: GpuVendor::Nvidia,
                name: Some(name.to_string()),
                vram_bytes: memory_mib * 1024 * 1024,
            })
        })
        .collect()
}

/// AMD cards via `rocm-smi --json`.
pub struct RocmSmiProbe;

impl GpuProbe for RocmSmiProbe {
    fn graphics_cards(&self) -> Vec<GpuInfo> {
        match Command::new("rocm-smi")
            .args(["--showmeminfo", "vram", "--json"])
            .output()
        {
            Ok(output) if output.status.success() => {
                parse_rocm_smi(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!("rocm-smi not available: {}", e);
                Vec::new()
            }
        }
    }
}

fn parse_rocm_smi(stdout: &str) -> Vec<GpuInfo> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(stdout) else {
        return Vec::new();
    };
    let Some(cards) = value.as_object() else {
        return Vec::new();
    };

    cards
        .iter()
        .filter(|(key, _)| key.starts_with("card"))
        .map(|(key, card)| {
            let vram_bytes = card
                .get("VRAM Total Memory (B)")
                .and_then(|v| match v {
                    serde_json::Value::String(s) => s.parse().ok(),
                    serde_json::Value::Number(n) => n.as_u64(),
                    _ => None,
                })
                .unwrap_or(0);
            GpuInfo {
                vendor: GpuVendor::Amd,
                name: Some(key.clone()),
                vram_bytes,
            }
        })
        .collect()
}

/// Linux DRM sysfs (`/sys/class/drm/card*/device`).
pub struct SysfsProbe {
    root: std::path::PathBuf,
}

impl SysfsProbe {
    pub fn new() -> Self {
        Self::with_root("/sys/class/drm")
    }

    pub fn with_root(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_card(device: &Path) -> Option<GpuInfo> {
        let vendor_id = std::fs::read_to_string(device.join("vendor")).ok()?;
        let vendor = GpuVendor::from_pci_id(&vendor_id);
        if vendor == GpuVendor::None {
            return None;
        }
        let vram_bytes = std::fs::read_to_string(device.join("mem_info_vram_total"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        Some(GpuInfo {
            vendor,
            name: None,
            vram_bytes,
        })
    }
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuProbe for SysfsProbe {
    fn graphics_cards(&self) -> Vec<GpuInfo> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };

        entries
            .flatten()
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                // card0 but not card0-HDMI-A-1
                name.starts_with("card") && !name.contains('-')
            })
            .filter_map(|entry| Self::read_card(&entry.path().join("device")))
            .collect()
    }
}

/// Runs several probes and keeps the richest answer per vendor.
pub struct CompositeProbe {
    probes: Vec<Box<dyn GpuProbe>>,
}

impl CompositeProbe {
    pub fn new(probes: Vec<Box<dyn GpuProbe>>) -> Self {
        Self { probes }
    }

    /// The probes appropriate for this platform.
    pub fn system() -> Self {
        let mut probes: Vec<Box<dyn GpuProbe>> = vec![Box::new(NvidiaSmiProbe), Box::new(RocmSmiProbe)];
        if cfg!(target_os = "linux") {
            probes.push(Box::new(SysfsProbe::new()));
        }
        Self::new(probes)
    }
}

impl GpuProbe for CompositeProbe {
    fn graphics_cards(&self) -> Vec<GpuInfo> {
        let mut cards: Vec<GpuInfo> = Vec::new();
        for probe in &self.probes {
            for card in probe.graphics_cards() {
                // sysfs duplicates what the vendor tools already reported
                if card.name.is_none()
                    && cards.iter().any(|c| c.vendor == card.vendor && c.name.is_some())
                {
                    continue;
                }
                cards.push(card);
            }
        }
        cards
    }
}

/// Probe that reports a fixed set of cards.
pub struct StaticProbe(pub Vec<GpuInfo>);

impl GpuProbe for StaticProbe {
    fn graphics_cards(&self) -> Vec<GpuInfo> {
        self.0.clone()
    }
}

fn probe_cache() -> &'static Cache<(), Arc<Vec<GpuInfo>>> {
    static CACHE: OnceLock<Cache<(), Arc<Vec<GpuInfo>>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Cache::builder()
            .max_capacity(1)
            .time_to_live(Duration::from_secs(300))
            .build()
    })
}

/// Enumerate system GPUs, cached for the process lifetime with a TTL.
pub fn system_gpus() -> Arc<Vec<GpuInfo>> {
    if let Some(cards) = probe_cache().get(&()) {
        return cards;
    }
    let cards = Arc::new(CompositeProbe::system().graphics_cards());
    probe_cache().insert((), cards.clone());
    cards
}

/// Pick the primary vendor and the largest VRAM among its cards.
pub fn primary_gpu(cards: &[GpuInfo]) -> (GpuVendor, u64) {
    let best = cards
        .iter()
        .filter(|c| c.vendor != GpuVendor::None)
        .max_by_key(|c| c.vram_bytes);

    match best {
        Some(card) => (card.vendor, card.vram_bytes),
        None => (GpuVendor::None, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_vendor_matching() {
        assert_eq!(GpuVendor::from_vendor_name("NVIDIA Corporation"), GpuVendor::Nvidia);
        assert_eq!(
            GpuVendor::from_vendor_name("Advanced Micro Devices, Inc. [AMD/ATI]"),
            GpuVendor::Amd
        );
        assert_eq!(GpuVendor::from_vendor_name("Intel Corporation"), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_name("Matrox"), GpuVendor::None);
        assert_eq!(GpuVendor::from_pci_id("0x10DE\n"), GpuVendor::Nvidia);
    }

    #[test]
    fn test_parse_nvidia_smi() {
        let cards = parse_nvidia_smi("NVIDIA GeForce RTX 4090, 24564\nTesla T4, 15360\n");
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].vram_bytes, 24564 * 1024 * 1024);
        assert_eq!(cards[1].name.as_deref(), Some("Tesla T4"));
    }

    #[test]
    fn test_parse_rocm_smi() {
        let cards = parse_rocm_smi(
            r#"{"card0": {"VRAM Total Memory (B)": "17163091968", "VRAM Total Used Memory (B)": "1"}, "system": {}}"#,
        );
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].vendor, GpuVendor::Amd);
        assert_eq!(cards[0].vram_bytes, 17_163_091_968);
    }

    #[test]
    fn test_sysfs_probe() {
        let root = TempDir::new().unwrap();
        let device = root.path().join("card0").join("device");
        std::fs::create_dir_all(&device).unwrap();
        std::fs::write(device.join("vendor"), "0x1002\n").unwrap();
        std::fs::write(device.join("mem_info_vram_total"), "8589934592\n").unwrap();
        std::fs::create_dir_all(root.path().join("card0-HDMI-A-1")).unwrap();

        let cards = SysfsProbe::with_root(root.path()).graphics_cards();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].vendor, GpuVendor::Amd);
        assert_eq!(cards[0].vram_bytes, 8_589_934_592);
    }

    #[test]
    fn test_primary_gpu() {
        let cards = vec![
            GpuInfo {
                vendor: GpuVendor::Intel,
                name: None,
                vram_bytes: 1 << 30,
            },
            GpuInfo {
                vendor: GpuVendor::Nvidia,
                name: Some("A100".into()),
                vram_bytes: 80 << 30,
            },
        ];
        assert_eq!(primary_gpu(&cards), (GpuVendor::Nvidia, 80 << 30));
        assert_eq!(primary_gpu(&[]), (GpuVendor::None, 0));
    }
}
