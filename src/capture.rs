// Capture engine module

pub mod monitor;
pub mod policy;
pub mod wgc;

// Re-export commonly used types and functions
pub use monitor::{enable_dpi_awareness, enumerate_monitors, find_monitor_by_name, MonitorInfo};
pub use policy::CapturePolicy;
pub use wgc::{init_capture, WGCCapture};
