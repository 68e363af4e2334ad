//! GPU memory detection
//!
//! Queries nvidia-smi for the devices visible to this process and their
//! memory. Used to size the memory budget when `total_memory_gb` is not
//! configured. In multi-tenant containers nvidia-smi only reports the GPUs
//! allocated to the container, which is the budget we want.

use std::process::Command;
use std::sync::OnceLock;

const MIB_PER_GIB: f64 = 1024.0;

/// Cached GPU information detected at startup
static GPU_INFO: OnceLock<GpuInfo> = OnceLock::new();

/// One visible GPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    pub index: u32,
    pub memory_mib: u64,
}

/// Information about available GPUs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuInfo {
    pub devices: Vec<GpuDevice>,
}

impl GpuInfo {
    pub fn count(&self) -> usize {
        self.devices.len()
    }

    /// Combined memory of all visible GPUs, `None` when there are none
    pub fn total_memory_gb(&self) -> Option<f64> {
        if self.devices.is_empty() {
            return None;
        }
        let mib: u64 = self.devices.iter().map(|d| d.memory_mib).sum();
        Some(mib as f64 / MIB_PER_GIB)
    }
}

/// Parse `nvidia-smi --query-gpu=index,memory.total --format=csv,noheader,nounits`
pub fn parse_memory_query(stdout: &str) -> GpuInfo {
    let devices = stdout
        .lines()
        .filter_map(|line| {
            let (index, memory) = line.split_once(',')?;
            Some(GpuDevice {
                index: index.trim().parse().ok()?,
                memory_mib: memory.trim().parse().ok()?,
            })
        })
        .collect();

    GpuInfo { devices }
}

/// Detect available GPUs and their memory using nvidia-smi
pub fn detect_gpus() -> GpuInfo {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let info = parse_memory_query(&String::from_utf8_lossy(&output.stdout));
            tracing::info!(
                gpu_count = info.count(),
                devices = ?info.devices,
                total_memory_gb = ?info.total_memory_gb(),
                "Detected available GPUs"
            );
            info
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                stderr = %stderr,
                "nvidia-smi failed, assuming no GPUs available"
            );
            GpuInfo::default()
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to run nvidia-smi, assuming no GPUs available"
            );
            GpuInfo::default()
        }
    }
}

/// Get cached GPU info, detecting on first use
pub fn get_or_init() -> &'static GpuInfo {
    GPU_INFO.get_or_init(detect_gpus)
}
