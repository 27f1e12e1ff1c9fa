//! VM lifecycle management
//!
//! This module owns everything a single VM needs from start to stop:
//! - configuration model ([`config`])
//! - runtime instance state ([`instance`])
//! - the monitor control channel ([`monitor`])
//! - thread discovery and classification ([`threads`])
//! - resource placement ([`placement`])
//! - guest network attachment with fd passing ([`net_attach`])
//! - the Start/Stop orchestrators ([`lifecycle`])

pub mod config;
pub mod cpuset;
pub mod instance;
pub mod lifecycle;
pub mod monitor;
pub mod net_attach;
pub mod placement;
pub mod threads;

pub use config::VmConfig;
pub use cpuset::CpuSet;
pub use instance::{RunningReason, ShutoffReason, VmInstance, VmState};
pub use lifecycle::{start, stop};
pub use monitor::{HttpMonitor, VmMonitor};
pub use threads::{ThreadClass, ThreadDescriptor};
