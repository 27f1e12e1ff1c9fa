//! VM domain configuration
//!
//! The declarative description of one VM: virtualization backend, vCPU
//! topology and pinning, CPU bandwidth tuning, NUMA placement, guest
//! networks, console/serial devices, and the boot payload handed to the
//! VMM on `vm.create`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cpuset::{CpuSet, NodeSet};

/// Virtualization backend the VMM must use for this VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VirtType {
    Kvm,
    /// Microsoft Hypervisor (mshv device).
    Hyperv,
}

/// How the VM-wide CPU placement is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementMode {
    /// Use the masks given in the configuration.
    #[default]
    Static,
    /// Use a node-local mask computed by an external placement advisor
    /// and recorded on the instance before start.
    Auto,
}

/// NUMA memory binding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumaMode {
    Strict,
    Restrictive,
    Preferred,
    Interleave,
}

impl NumaMode {
    /// Modes that bind memory hard enough to warrant a cpuset.mems write.
    pub fn binds_memory(self) -> bool {
        matches!(self, NumaMode::Strict | NumaMode::Restrictive)
    }
}

/// NUMA memory tuning for the whole VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumaTune {
    pub mode: NumaMode,
    /// Explicit node set; absent when the nodes come from automatic
    /// placement.
    #[serde(default)]
    pub nodeset: Option<NodeSet>,
}

/// Scheduling policy for a placed thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    Other,
    Batch,
    Idle,
    Fifo,
    #[serde(rename = "rr")]
    RoundRobin,
}

impl SchedPolicy {
    pub fn to_raw(self) -> libc::c_int {
        match self {
            SchedPolicy::Other => libc::SCHED_OTHER,
            SchedPolicy::Batch => libc::SCHED_BATCH,
            SchedPolicy::Idle => libc::SCHED_IDLE,
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::RoundRobin => libc::SCHED_RR,
        }
    }

    /// Real-time policies carry a priority; the rest must use 0.
    pub fn is_realtime(self) -> bool {
        matches!(self, SchedPolicy::Fifo | SchedPolicy::RoundRobin)
    }
}

/// Optional scheduler override for a thread class that supports one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerDirective {
    pub policy: SchedPolicy,
    #[serde(default)]
    pub priority: i32,
}

/// CFS bandwidth limit. `period == 0` or `quota <= 0` leaves the
/// corresponding half unset; when both are unset the limit does not
/// participate in placement at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuBandwidth {
    #[serde(default)]
    pub period: u64,
    #[serde(default)]
    pub quota: i64,
}

impl CpuBandwidth {
    pub fn new(period: u64, quota: i64) -> Self {
        Self { period, quota }
    }

    /// True when either half is set; this is what gates the CPU-controller
    /// requirement and the cpu.max write.
    pub fn any_set(self) -> bool {
        self.period > 0 || self.quota > 0
    }
}

/// CPU tuning knobs for the whole VM and for each thread class.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuTune {
    /// Per-vCPU bandwidth.
    #[serde(default)]
    pub vcpu: CpuBandwidth,
    /// VM-wide bandwidth, applied to the VM root cgroup once thread
    /// cgroups exist.
    #[serde(default)]
    pub global: CpuBandwidth,
    /// Emulator-thread bandwidth.
    #[serde(default)]
    pub emulator: CpuBandwidth,
    /// I/O-thread bandwidth.
    #[serde(default)]
    pub iothread: CpuBandwidth,
    /// Pin mask for emulator threads.
    #[serde(default)]
    pub emulatorpin: Option<CpuSet>,
    /// Scheduler override requested for emulator threads. The placement
    /// engine suppresses it for the emulator class; kept in the model so
    /// the request is visible in the configuration.
    #[serde(default)]
    pub emulatorsched: Option<SchedulerDirective>,
}

/// One vCPU in the topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcpuDef {
    pub id: usize,
    #[serde(default = "default_true")]
    pub online: bool,
    /// Per-vCPU pin mask; falls back to the VM-wide mask.
    #[serde(default)]
    pub cpumask: Option<CpuSet>,
    #[serde(default)]
    pub sched: Option<SchedulerDirective>,
}

fn default_true() -> bool {
    true
}

/// One guest network interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetDef {
    pub id: String,
    pub mac: String,
    /// Host-side tap interface name; derived from the id when absent.
    #[serde(default)]
    pub ifname: Option<String>,
    /// Requested virtio queue pairs; 0 means "unset" and is treated as 1.
    #[serde(default)]
    pub queues: u32,
    #[serde(default)]
    pub mtu: Option<u16>,
}

impl NetDef {
    /// Queue-pair count actually used: the declared value, or 1 when unset.
    pub fn queue_pairs(&self) -> u32 {
        if self.queues == 0 {
            1
        } else {
            self.queues
        }
    }

    /// Host-side tap device name.
    pub fn tap_name(&self) -> String {
        self.ifname
            .clone()
            .unwrap_or_else(|| format!("{}-tap", self.id))
    }
}

/// Backend of a console or serial device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChrSource {
    /// VMM-allocated pseudo-terminal; the path is learned from the VMM
    /// after boot.
    Pty {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// Pre-negotiated Unix socket; needs no post-boot reconciliation.
    Unix { path: PathBuf },
}

/// A console or serial device definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChrDef {
    pub source: ChrSource,
}

/// One guest disk handed to the VMM on create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskDef {
    pub path: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

/// Complete declarative configuration of one VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    #[serde(default = "Uuid::now_v7")]
    pub uuid: Uuid,
    pub virt_type: VirtType,

    #[serde(default)]
    pub placement_mode: PlacementMode,
    /// VM-wide CPU mask; per-entity masks take priority over it.
    #[serde(default)]
    pub cpumask: Option<CpuSet>,
    #[serde(default)]
    pub numatune: Option<NumaTune>,
    #[serde(default)]
    pub cputune: CpuTune,
    #[serde(default)]
    pub vcpus: Vec<VcpuDef>,

    #[serde(default)]
    pub nets: Vec<NetDef>,
    #[serde(default)]
    pub console: Option<ChrDef>,
    #[serde(default)]
    pub serial: Option<ChrDef>,

    /// Boot payload.
    pub kernel: PathBuf,
    #[serde(default)]
    pub cmdline: String,
    #[serde(default)]
    pub disks: Vec<DiskDef>,
    pub memory_bytes: u64,
}

impl VmConfig {
    pub fn vcpu(&self, id: usize) -> Option<&VcpuDef> {
        self.vcpus.iter().find(|v| v.id == id)
    }

    pub fn online_vcpus(&self) -> impl Iterator<Item = &VcpuDef> {
        self.vcpus.iter().filter(|v| v.online)
    }

    /// NUMA node count declared for the guest. The model carries no guest
    /// NUMA topology beyond the tuning nodeset, so this is the nodeset
    /// cardinality (0 when numatune is absent).
    pub fn numa_node_count(&self) -> usize {
        self.numatune
            .as_ref()
            .and_then(|n| n.nodeset.as_ref())
            .map(|n| n.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config_json() -> &'static str {
        r#"{
            "name": "guest0",
            "virt_type": "kvm",
            "kernel": "/var/lib/vmshepherd/vmlinux",
            "memory_bytes": 1073741824
        }"#
    }

    #[test]
    fn test_minimal_config_deserializes_with_defaults() {
        let config: VmConfig = serde_json::from_str(minimal_config_json()).unwrap();
        assert_eq!(config.name, "guest0");
        assert_eq!(config.virt_type, VirtType::Kvm);
        assert_eq!(config.placement_mode, PlacementMode::Static);
        assert!(config.nets.is_empty());
        assert!(config.cpumask.is_none());
        assert!(!config.cputune.vcpu.any_set());
    }

    #[test]
    fn test_queue_pairs_default_to_one() {
        let net = NetDef {
            id: "net0".into(),
            mac: "52:54:00:12:34:56".into(),
            ifname: None,
            queues: 0,
            mtu: None,
        };
        assert_eq!(net.queue_pairs(), 1);
        assert_eq!(net.tap_name(), "net0-tap");
    }

    #[test]
    fn test_bandwidth_unset_semantics() {
        assert!(!CpuBandwidth::new(0, 0).any_set());
        assert!(!CpuBandwidth::new(0, -1).any_set());
        assert!(CpuBandwidth::new(100_000, 0).any_set());
        assert!(CpuBandwidth::new(0, 50_000).any_set());
    }

    #[test]
    fn test_cpumask_deserializes_from_list_syntax() {
        let json = r#"{
            "name": "guest1",
            "virt_type": "kvm",
            "cpumask": "0-3",
            "kernel": "/vmlinux",
            "memory_bytes": 536870912
        }"#;
        let config: VmConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cpumask.unwrap().len(), 4);
    }

    #[test]
    fn test_sched_policy_raw_values() {
        assert_eq!(SchedPolicy::Fifo.to_raw(), libc::SCHED_FIFO);
        assert!(SchedPolicy::Fifo.is_realtime());
        assert!(!SchedPolicy::Batch.is_realtime());
    }
}
