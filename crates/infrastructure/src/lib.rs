pub mod resource_monitor;

pub use resource_monitor::{
    ProcessSnapshot, ResourceMonitor, SysinfoSampler, SystemSampler, SystemSnapshot,
};
