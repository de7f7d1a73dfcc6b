pub mod gpu;
pub mod process;
pub mod profile;
pub mod tunnel;

// Re-export main types
pub use gpu::{GpuInfo, GpuProcess};
pub use process::ProcessEntry;
pub use profile::ConnectionProfile;
pub use tunnel::{TunnelDescriptor, TunnelPreset};
