//! cgroup v2 hierarchy management for VMs
//!
//! Each VM gets its own cgroup under `/sys/fs/cgroup/vmshepherd/{machine}/`,
//! with one nested child per placed thread group:
//!
//! ```text
//! /sys/fs/cgroup/                     <- cgroup v2 root
//! └── vmshepherd/                     <- our namespace
//!     └── 4981-guest0/               <- per-VM cgroup (machine name)
//!         ├── cpu.max                 <- VM-wide bandwidth
//!         ├── emulator/               <- all emulator threads
//!         ├── vcpu0/                  <- one per vCPU
//!         └── iothread4987/           <- one per I/O thread
//! ```
//!
//! In cgroups v2, controllers must be enabled in a parent's
//! `cgroup.subtree_control` before children can use them, and a child that
//! holds individual threads (rather than whole processes) must be marked
//! `threaded`. Thread membership goes through `cgroup.threads`.
//!
//! The base path is configurable so the whole hierarchy can be rooted in a
//! scratch directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::vm::config::CpuBandwidth;
use crate::vm::cpuset::CpuSet;
use crate::vm::threads::ThreadClass;

/// Base path for the cgroup v2 filesystem.
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Our namespace within the cgroup hierarchy.
const CGROUP_NAMESPACE: &str = "vmshepherd";

/// Default CFS period applied when a bandwidth limit sets a quota but no
/// period, in microseconds.
const DEFAULT_CPU_PERIOD: u64 = 100_000;

/// A cgroup controller this driver knows how to configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Controller {
    Cpu,
    Cpuset,
    Memory,
}

impl Controller {
    pub fn name(self) -> &'static str {
        match self {
            Controller::Cpu => "cpu",
            Controller::Cpuset => "cpuset",
            Controller::Memory => "memory",
        }
    }
}

/// Creates and removes VM-scoped cgroup hierarchies.
pub struct CgroupManager {
    /// Namespace directory, e.g. /sys/fs/cgroup/vmshepherd
    base_path: PathBuf,
    controllers: Vec<Controller>,
}

impl CgroupManager {
    /// Open the manager at the default cgroup v2 mount.
    ///
    /// Creates the namespace directory and enables the configured
    /// controllers for child cgroups. Requires root privileges or delegated
    /// cgroup permissions.
    pub fn new(controllers: &[Controller]) -> io::Result<Self> {
        Self::with_root(Path::new(CGROUP_ROOT).join(CGROUP_NAMESPACE), controllers)
    }

    /// Open the manager rooted at an explicit namespace directory.
    pub fn with_root(base_path: impl Into<PathBuf>, controllers: &[Controller]) -> io::Result<Self> {
        let base_path = base_path.into();
        if !base_path.exists() {
            fs::create_dir_all(&base_path)?;
        }
        enable_subtree_controllers(&base_path, controllers)?;
        Ok(Self {
            base_path,
            controllers: controllers.to_vec(),
        })
    }

    /// Create (or reuse) the top-level cgroup for one VM.
    pub fn create_vm_root(&self, machine_name: &str) -> io::Result<VmCgroup> {
        let path = self.base_path.join(machine_name);
        fs::create_dir_all(&path)?;
        // Thread children can only use controllers enabled here.
        enable_subtree_controllers(&path, &self.controllers)?;
        Ok(VmCgroup {
            path,
            controllers: self.controllers.clone(),
        })
    }
}

/// The top-level cgroup of one VM. Thread cgroups are nested strictly
/// inside it and are removed with it.
#[derive(Debug)]
pub struct VmCgroup {
    path: PathBuf,
    controllers: Vec<Controller>,
}

impl VmCgroup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the driver configured this controller for the VM hierarchy.
    pub fn has_controller(&self, controller: Controller) -> bool {
        self.controllers.contains(&controller)
    }

    /// Create (or reuse) the nested cgroup for one `(class, index)` thread
    /// group and mark it threaded so individual tids can join.
    pub fn new_thread_cgroup(&self, class: ThreadClass, index: usize) -> io::Result<ThreadCgroup> {
        let path = self.path.join(class.cgroup_name(index));
        let created = !path.exists();
        fs::create_dir_all(&path)?;
        if created {
            fs::write(path.join("cgroup.type"), "threaded")?;
        }
        Ok(ThreadCgroup { path })
    }

    /// Apply a VM-wide bandwidth limit to the root node.
    pub fn set_bandwidth(&self, bandwidth: CpuBandwidth) -> io::Result<()> {
        write_cpu_max(&self.path, bandwidth)
    }

    /// Remove the whole hierarchy: thread children first, then the root.
    ///
    /// The kernel refuses to remove a cgroup that still has members, so
    /// this reports EBUSY until the VMM's threads are gone; callers retry.
    pub fn remove(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                remove_cgroup_node(&entry.path())?;
            }
        }
        remove_cgroup_node(&self.path)
    }
}

/// A nested per-thread-group cgroup.
#[derive(Debug)]
pub struct ThreadCgroup {
    path: PathBuf,
}

impl ThreadCgroup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move one OS thread into this cgroup.
    ///
    /// Must happen before limits are written: some controllers only apply
    /// settings to members that joined beforehand, notably on cgroup v2.
    pub fn attach_thread(&self, tid: i32) -> io::Result<()> {
        fs::write(self.path.join("cgroup.threads"), tid.to_string())
    }

    pub fn set_cpuset_cpus(&self, cpus: &CpuSet) -> io::Result<()> {
        fs::write(self.path.join("cpuset.cpus"), cpus.to_string())
    }

    pub fn set_cpuset_mems(&self, mems: &CpuSet) -> io::Result<()> {
        fs::write(self.path.join("cpuset.mems"), mems.to_string())
    }

    pub fn set_bandwidth(&self, bandwidth: CpuBandwidth) -> io::Result<()> {
        write_cpu_max(&self.path, bandwidth)
    }

    /// Remove this node. Used to roll back a partially configured thread
    /// group without touching the rest of the hierarchy.
    pub fn remove(&self) -> io::Result<()> {
        remove_cgroup_node(&self.path)
    }
}

/// rmdir one cgroup node. Control files cannot be unlinked on cgroupfs
/// (the attempts are ignored); regular files in scratch-rooted hierarchies
/// can, which keeps rmdir semantics identical in both.
fn remove_cgroup_node(path: &Path) -> io::Result<()> {
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
    fs::remove_dir(path)
}

fn enable_subtree_controllers(path: &Path, controllers: &[Controller]) -> io::Result<()> {
    if controllers.is_empty() {
        return Ok(());
    }
    let tokens: Vec<String> = controllers
        .iter()
        .map(|c| format!("+{}", c.name()))
        .collect();
    fs::write(path.join("cgroup.subtree_control"), tokens.join(" "))
}

/// Format and write `cpu.max`: "{quota} {period}", with "max" for an unset
/// quota and the kernel-default period when unset.
fn write_cpu_max(path: &Path, bandwidth: CpuBandwidth) -> io::Result<()> {
    fs::write(path.join("cpu.max"), format_cpu_max(bandwidth))
}

fn format_cpu_max(bandwidth: CpuBandwidth) -> String {
    let period = if bandwidth.period > 0 {
        bandwidth.period
    } else {
        DEFAULT_CPU_PERIOD
    };
    if bandwidth.quota > 0 {
        format!("{} {}", bandwidth.quota, period)
    } else {
        format!("max {period}")
    }
}
