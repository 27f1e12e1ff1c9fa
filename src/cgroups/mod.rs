//! cgroup v2 resource isolation for VMM processes

pub mod manager;

pub use manager::{CgroupManager, Controller, ThreadCgroup, VmCgroup};
