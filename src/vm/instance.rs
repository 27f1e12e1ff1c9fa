//! VM instance: one VM's runtime identity and owned resources
//!
//! A [`VmInstance`] pairs the declarative [`VmConfig`] with everything the
//! controller acquires while the VM runs: the VMM pid, the monitor
//! connection, the cgroup hierarchy, the derived machine name, and the
//! vCPU tid map. The instance is exclusively owned by one caller; Start
//! and Stop for the same instance must not run concurrently.
//!
//! Externally the pid is either 0 (not running) or the observed VMM pid.
//! Intermediate states exist only inside the orchestrators.

use std::collections::HashMap;

use crate::cgroups::VmCgroup;
use crate::vm::config::VmConfig;
use crate::vm::cpuset::CpuSet;
use crate::vm::monitor::VmMonitor;
use crate::vm::threads;

/// Why a VM entered the Running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningReason {
    Booted,
    Restored,
}

/// Why a VM entered the Shutoff state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutoffReason {
    /// Never started, or cleanly shut down.
    Shutdown,
    /// Start failed and was rolled back.
    Failed,
    /// Forcibly destroyed by the caller.
    Destroyed,
}

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Shutoff(ShutoffReason),
    Running(RunningReason),
}

/// One VM and the host resources currently attached to it.
pub struct VmInstance {
    pub config: VmConfig,
    pub state: VmState,

    /// VMM process id; 0 when not running.
    pub pid: i32,
    /// Process-identity field; mirrors the pid while running, -1 otherwise.
    pub id: i32,
    /// Cgroup-scoped name derived at start, released at stop.
    pub machine_name: Option<String>,

    pub cgroup: Option<VmCgroup>,
    pub monitor: Option<Box<dyn VmMonitor>>,

    /// vCPU index -> OS thread id, as last reported by the monitor. May be
    /// empty when the VMM has not yet exposed per-vCPU threads.
    pub vcpu_pids: HashMap<usize, i32>,

    /// Node-local mask computed by automatic placement, when the config
    /// uses [`PlacementMode::Auto`].
    ///
    /// [`PlacementMode::Auto`]: crate::vm::config::PlacementMode::Auto
    pub auto_cpuset: Option<CpuSet>,
    /// NUMA node set chosen by automatic placement.
    pub auto_nodeset: Option<CpuSet>,

    /// Kernel interface indexes of the attached guest networks.
    pub nic_indexes: Vec<i32>,
}

impl VmInstance {
    pub fn new(config: VmConfig) -> Self {
        Self {
            config,
            state: VmState::Shutoff(ShutoffReason::Shutdown),
            pid: 0,
            id: -1,
            machine_name: None,
            cgroup: None,
            monitor: None,
            vcpu_pids: HashMap::new(),
            auto_cpuset: None,
            auto_nodeset: None,
            nic_indexes: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, VmState::Running(_))
    }

    /// Cgroup-safe machine name: `<id>-<name>` with anything outside
    /// `[A-Za-z0-9_.-]` replaced, truncated to 64 bytes.
    pub fn derive_machine_name(&self) -> String {
        let sanitized: String = self
            .config
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let mut name = format!("{}-{}", self.id, sanitized);
        name.truncate(64);
        name
    }

    pub fn has_vcpu_pids(&self) -> bool {
        !self.vcpu_pids.is_empty()
    }

    pub fn vcpu_pid(&self, vcpu_id: usize) -> Option<i32> {
        self.vcpu_pids.get(&vcpu_id).copied()
    }

    /// Pull a fresh thread view from the monitor and rebuild the vCPU tid
    /// map from it.
    pub async fn refresh_thread_info(&mut self) -> crate::error::VmResult<()> {
        let Some(monitor) = self.monitor.as_mut() else {
            return Ok(());
        };
        monitor.refresh_threads().await?;
        self.vcpu_pids = threads::vcpu_tids(monitor.threads());
        Ok(())
    }
}

impl std::fmt::Debug for VmInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmInstance")
            .field("name", &self.config.name)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("machine_name", &self.machine_name)
            .field("vcpu_pids", &self.vcpu_pids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::config::VirtType;

    fn instance(name: &str) -> VmInstance {
        let config = VmConfig {
            name: name.into(),
            uuid: uuid::Uuid::now_v7(),
            virt_type: VirtType::Kvm,
            placement_mode: Default::default(),
            cpumask: None,
            numatune: None,
            cputune: Default::default(),
            vcpus: vec![],
            nets: vec![],
            console: None,
            serial: None,
            kernel: "/vmlinux".into(),
            cmdline: String::new(),
            disks: vec![],
            memory_bytes: 1 << 29,
        };
        VmInstance::new(config)
    }

    #[test]
    fn test_fresh_instance_is_shutoff() {
        let vm = instance("guest0");
        assert!(!vm.is_active());
        assert_eq!(vm.pid, 0);
        assert_eq!(vm.id, -1);
        assert!(vm.machine_name.is_none());
    }

    #[test]
    fn test_machine_name_sanitized_and_bounded() {
        let mut vm = instance("web/front end");
        vm.id = 4981;
        assert_eq!(vm.derive_machine_name(), "4981-web-front-end");

        let mut vm = instance(&"x".repeat(100));
        vm.id = 1;
        assert!(vm.derive_machine_name().len() <= 64);
    }
}
