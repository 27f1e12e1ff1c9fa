//! Thread classification and discovery
//!
//! The VMM starts several classes of OS threads (emulator housekeeping,
//! virtio I/O workers, one thread per vCPU). Placement rules differ per
//! class, so every thread the monitor reports is translated into a typed
//! [`ThreadDescriptor`] before it reaches the placement engine.
//!
//! Descriptors are fetched fresh from the monitor on every configuration
//! pass and never cached across a restart.

/// Placement class of one VMM OS thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadClass {
    Emulator,
    IoThread,
    Vcpu,
}

impl ThreadClass {
    /// Name of the nested cgroup a thread of this class lands in.
    ///
    /// All emulator threads share one cgroup; vCPU and I/O threads get one
    /// per logical index.
    pub fn cgroup_name(self, index: usize) -> String {
        match self {
            ThreadClass::Emulator => "emulator".to_string(),
            ThreadClass::Vcpu => format!("vcpu{index}"),
            ThreadClass::IoThread => format!("iothread{index}"),
        }
    }
}

impl std::fmt::Display for ThreadClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadClass::Emulator => write!(f, "emulator"),
            ThreadClass::IoThread => write!(f, "iothread"),
            ThreadClass::Vcpu => write!(f, "vcpu"),
        }
    }
}

/// Raw thread record as the monitor discovers it: tid, kernel thread name,
/// and the class inferred from the name.
#[derive(Debug, Clone)]
pub struct MonitorThread {
    pub tid: i32,
    pub name: String,
    pub class: ThreadClass,
}

impl MonitorThread {
    /// Classify a thread by its kernel comm name. The VMM names vCPU
    /// threads `vcpu<N>` and virtio worker threads with a leading
    /// underscore (`_disk0`, `_net1`, ...); everything else belongs to the
    /// emulator.
    pub fn classify(tid: i32, name: &str) -> Self {
        let class = if parse_vcpu_index(name).is_some() {
            ThreadClass::Vcpu
        } else if name.starts_with('_') {
            ThreadClass::IoThread
        } else {
            ThreadClass::Emulator
        };
        Self {
            tid,
            name: name.to_string(),
            class,
        }
    }

    /// The vCPU index encoded in the thread name, for vCPU threads.
    pub fn vcpu_index(&self) -> Option<usize> {
        parse_vcpu_index(&self.name)
    }
}

fn parse_vcpu_index(name: &str) -> Option<usize> {
    let suffix = name.strip_prefix("vcpu")?;
    if suffix.is_empty() {
        return None;
    }
    suffix.parse().ok()
}

/// A typed thread descriptor consumed by the placement engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadDescriptor {
    pub tid: i32,
    pub class: ThreadClass,
    /// Logical index within the class. All emulator threads share index 0
    /// (they share one cgroup); I/O threads are keyed by tid, matching how
    /// the monitor reports them.
    pub index: usize,
    pub name: Option<String>,
}

/// Emulator threads in the monitor's current view.
pub fn emulator_threads(threads: &[MonitorThread]) -> Vec<ThreadDescriptor> {
    threads
        .iter()
        .filter(|t| t.class == ThreadClass::Emulator)
        .map(|t| ThreadDescriptor {
            tid: t.tid,
            class: ThreadClass::Emulator,
            index: 0,
            name: Some(t.name.clone()),
        })
        .collect()
}

/// I/O threads in the monitor's current view.
pub fn io_threads(threads: &[MonitorThread]) -> Vec<ThreadDescriptor> {
    threads
        .iter()
        .filter(|t| t.class == ThreadClass::IoThread)
        .map(|t| ThreadDescriptor {
            tid: t.tid,
            class: ThreadClass::IoThread,
            index: t.tid as usize,
            name: Some(t.name.clone()),
        })
        .collect()
}

/// vCPU thread ids keyed by vCPU index, from the monitor's current view.
pub fn vcpu_tids(threads: &[MonitorThread]) -> std::collections::HashMap<usize, i32> {
    threads
        .iter()
        .filter_map(|t| t.vcpu_index().map(|idx| (idx, t.tid)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_vcpu_threads() {
        let t = MonitorThread::classify(101, "vcpu0");
        assert_eq!(t.class, ThreadClass::Vcpu);
        assert_eq!(t.vcpu_index(), Some(0));

        let t = MonitorThread::classify(102, "vcpu12");
        assert_eq!(t.vcpu_index(), Some(12));
    }

    #[test]
    fn test_classify_io_threads() {
        let t = MonitorThread::classify(103, "_disk0");
        assert_eq!(t.class, ThreadClass::IoThread);
        assert_eq!(t.vcpu_index(), None);
    }

    #[test]
    fn test_classify_emulator_threads() {
        for name in ["vmm", "cloud-hypervisor", "http-server", "signal_handler"] {
            let t = MonitorThread::classify(104, name);
            assert_eq!(t.class, ThreadClass::Emulator, "{name}");
        }
        // "vcpu" without an index is not a vCPU thread
        let t = MonitorThread::classify(105, "vcpu");
        assert_eq!(t.class, ThreadClass::Emulator);
    }

    #[test]
    fn test_cgroup_names() {
        assert_eq!(ThreadClass::Emulator.cgroup_name(0), "emulator");
        assert_eq!(ThreadClass::Vcpu.cgroup_name(3), "vcpu3");
        assert_eq!(ThreadClass::IoThread.cgroup_name(4981), "iothread4981");
    }

    #[test]
    fn test_adapter_filters_mixed_thread_list() {
        let threads = vec![
            MonitorThread::classify(100, "vmm"),
            MonitorThread::classify(101, "http-server"),
            MonitorThread::classify(102, "vcpu0"),
            MonitorThread::classify(103, "vcpu1"),
            MonitorThread::classify(104, "_disk0"),
        ];

        let emulators = emulator_threads(&threads);
        assert_eq!(emulators.len(), 2);
        assert!(emulators.iter().all(|t| t.index == 0));

        let io = io_threads(&threads);
        assert_eq!(io.len(), 1);
        assert_eq!(io[0].tid, 104);
        assert_eq!(io[0].index, 104);

        let vcpus = vcpu_tids(&threads);
        assert_eq!(vcpus.get(&0), Some(&102));
        assert_eq!(vcpus.get(&1), Some(&103));
    }
}
