use serde::Serialize;

/// One GPU as reported by `nvidia-smi`.
///
/// Numeric readings are `None` when the driver reports them as unavailable
/// (`[N/A]`, `[Not Supported]`), as it does for memory on unified-memory parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub memory_used_mib: Option<u64>,
    pub memory_total_mib: Option<u64>,
    pub utilization_percent: Option<u32>,
    pub temperature_c: Option<u32>,
    pub processes: Vec<GpuProcess>,
}

/// A compute process holding memory on a GPU
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuProcess {
    pub pid: u32,
    pub name: String,
    pub used_memory_mib: Option<u64>,
}

impl GpuInfo {
    /// `used / total MiB`, or `N/A` when either side is unknown
    pub fn memory_summary(&self) -> String {
        match (self.memory_used_mib, self.memory_total_mib) {
            (Some(used), Some(total)) => format!("{} / {} MiB", used, total),
            (Some(used), None) => format!("{} MiB", used),
            _ => "N/A".to_string(),
        }
    }
}
