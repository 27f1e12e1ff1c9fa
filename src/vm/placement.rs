//! Resource placement for VMM threads
//!
//! One entry point, [`place_thread`], covers every thread class the VMM
//! runs. It creates the thread's nested cgroup, moves the tid in, writes
//! cpuset and bandwidth limits, applies legacy affinity, and applies an
//! optional scheduler directive. The per-class differences (which mask,
//! which bandwidth, whether a scheduler override is honored) are carried in
//! the request, not in per-class code paths.
//!
//! Ordering matters twice here:
//! - the tid joins the cgroup before any limit is written, since cgroup v2
//!   controllers only apply some settings to members that joined first;
//! - legacy affinity is applied even when no cgroup controller is
//!   available, because affinity does not depend on cgroups at all.

use tracing::{debug, info, warn};

use super::config::{CpuBandwidth, PlacementMode, SchedulerDirective};
use super::cpuset::{self, CpuSet};
use super::instance::VmInstance;
use super::threads::ThreadClass;
use crate::cgroups::{Controller, ThreadCgroup};
use crate::error::{VmError, VmResult};

/// Everything [`place_thread`] needs to know about one thread.
#[derive(Debug)]
pub struct PlacementRequest<'a> {
    pub class: ThreadClass,
    /// Logical index within the class; keys the nested cgroup.
    pub index: usize,
    /// OS thread id to place.
    pub tid: i32,
    /// Explicit per-entity mask, highest priority in the resolution order.
    pub cpumask: Option<&'a CpuSet>,
    pub bandwidth: CpuBandwidth,
    pub sched: Option<&'a SchedulerDirective>,
}

/// The masks a placement call will actually use. `cgroup_mask` feeds
/// cpuset.cpus; `affinity_mask` feeds sched_setaffinity. They are the same
/// except in the all-host-CPUs fallback, which applies only to affinity.
#[derive(Debug, PartialEq, Eq)]
struct MaskPlan {
    cgroup_mask: Option<CpuSet>,
    affinity_mask: Option<CpuSet>,
}

/// Resolve which CPU mask applies, first match wins:
/// 1. the explicit per-entity mask,
/// 2. the automatic node-local mask when placement mode is Auto,
/// 3. the VM-wide mask,
/// 4. all online host CPUs. The VMM inherited this controller's affinity
///    at spawn, so "unconstrained" must be written out explicitly.
fn resolve_masks(vm: &VmInstance, explicit: Option<&CpuSet>) -> VmResult<MaskPlan> {
    let pick = |mask: &CpuSet| MaskPlan {
        cgroup_mask: Some(mask.clone()),
        affinity_mask: Some(mask.clone()),
    };

    if let Some(mask) = explicit.filter(|m| !m.is_empty()) {
        return Ok(pick(mask));
    }
    if vm.config.placement_mode == PlacementMode::Auto {
        if let Some(mask) = vm.auto_cpuset.as_ref().filter(|m| !m.is_empty()) {
            return Ok(pick(mask));
        }
    }
    if let Some(mask) = vm.config.cpumask.as_ref().filter(|m| !m.is_empty()) {
        return Ok(pick(mask));
    }
    Ok(MaskPlan {
        cgroup_mask: None,
        affinity_mask: Some(cpuset::host_online_cpus()?),
    })
}

/// Memory nodes to bind via cpuset.mems, for NUMA modes that bind memory.
fn numa_memory_nodes(vm: &VmInstance) -> Option<CpuSet> {
    let tune = vm.config.numatune.as_ref()?;
    if !tune.mode.binds_memory() {
        return None;
    }
    tune.nodeset
        .clone()
        .or_else(|| vm.auto_nodeset.clone())
        .filter(|n| !n.is_empty())
}

/// Place one VMM thread: nested cgroup, affinity, scheduler.
///
/// Any failure after the nested cgroup is created removes that cgroup
/// again before the error propagates, so aborted placements leave no empty
/// nodes behind.
pub fn place_thread(vm: &VmInstance, request: &PlacementRequest<'_>) -> VmResult<()> {
    let has_cpu = vm
        .cgroup
        .as_ref()
        .is_some_and(|c| c.has_controller(Controller::Cpu));
    let has_cpuset = vm
        .cgroup
        .as_ref()
        .is_some_and(|c| c.has_controller(Controller::Cpuset));

    if request.bandwidth.any_set() && !has_cpu {
        return Err(VmError::ConfigUnsupported(
            "cgroup cpu controller is required for bandwidth tuning".into(),
        ));
    }

    let plan = resolve_masks(vm, request.cpumask)?;

    // Without cpu and cpuset controllers there is nothing for the cgroup
    // layer to do; affinity below still applies.
    let mut thread_cgroup: Option<ThreadCgroup> = None;
    if has_cpu || has_cpuset {
        let root = vm
            .cgroup
            .as_ref()
            .ok_or_else(|| VmError::Internal("controller set but no VM cgroup".into()))?;
        let cgroup = root
            .new_thread_cgroup(request.class, request.index)
            .map_err(|e| {
                VmError::system(
                    format!("create {} cgroup", request.class.cgroup_name(request.index)),
                    e,
                )
            })?;
        info!(tid = request.tid, cgroup = %cgroup.path().display(), "adding thread to cgroup");

        if let Err(e) = configure_thread_cgroup(&cgroup, request, &plan, vm, has_cpu, has_cpuset) {
            rollback_thread_cgroup(&cgroup);
            return Err(e);
        }
        thread_cgroup = Some(cgroup);
    }

    if let Err(e) = apply_thread_controls(request, &plan) {
        if let Some(cgroup) = &thread_cgroup {
            rollback_thread_cgroup(cgroup);
        }
        return Err(e);
    }
    Ok(())
}

fn configure_thread_cgroup(
    cgroup: &ThreadCgroup,
    request: &PlacementRequest<'_>,
    plan: &MaskPlan,
    vm: &VmInstance,
    has_cpu: bool,
    has_cpuset: bool,
) -> VmResult<()> {
    // Membership first; cpuset and bandwidth writes only cover threads
    // that are already in the group.
    cgroup
        .attach_thread(request.tid)
        .map_err(|e| VmError::system(format!("attach tid {} to cgroup", request.tid), e))?;

    if has_cpuset {
        if let Some(mask) = &plan.cgroup_mask {
            cgroup
                .set_cpuset_cpus(mask)
                .map_err(|e| VmError::system("write cpuset.cpus", e))?;
        }
        if let Some(nodes) = numa_memory_nodes(vm) {
            cgroup
                .set_cpuset_mems(&nodes)
                .map_err(|e| VmError::system("write cpuset.mems", e))?;
        }
    }

    if has_cpu && request.bandwidth.any_set() {
        cgroup
            .set_bandwidth(request.bandwidth)
            .map_err(|e| VmError::system("write cpu.max", e))?;
    }
    Ok(())
}

/// Affinity and scheduler, the parts that work without any cgroup.
fn apply_thread_controls(request: &PlacementRequest<'_>, plan: &MaskPlan) -> VmResult<()> {
    if let Some(mask) = plan.affinity_mask.as_ref().filter(|m| !m.is_empty()) {
        set_affinity(request.tid, mask)?;
    }

    // The emulator main thread keeps the default policy even when the
    // configuration carries a directive.
    if let Some(sched) = request.sched {
        if request.class != ThreadClass::Emulator {
            set_scheduler(request.tid, sched)?;
        }
    }
    Ok(())
}

fn rollback_thread_cgroup(cgroup: &ThreadCgroup) {
    if let Err(e) = cgroup.remove() {
        warn!(cgroup = %cgroup.path().display(), error = %e,
              "failed to remove thread cgroup after placement failure");
    }
}

/// Pin one thread with the legacy per-thread affinity call.
pub fn set_affinity(tid: i32, mask: &CpuSet) -> VmResult<()> {
    let sched_set = mask.to_sched_set()?;
    nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(tid), &sched_set)
        .map_err(|e| VmError::errno(format!("set affinity of tid {tid} to {mask}"), e))
}

fn set_scheduler(tid: i32, directive: &SchedulerDirective) -> VmResult<()> {
    // Non-realtime policies require priority 0.
    let priority = if directive.policy.is_realtime() {
        directive.priority
    } else {
        0
    };
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: param is a valid sched_param for the duration of the call.
    let rc = unsafe { libc::sched_setscheduler(tid, directive.policy.to_raw(), &param) };
    if rc < 0 {
        return Err(VmError::system(
            format!("set scheduler of tid {tid}"),
            std::io::Error::last_os_error(),
        ));
    }
    debug!(tid, policy = ?directive.policy, priority, "scheduler applied");
    Ok(())
}

/// Apply the VM's initial, pre-boot affinity to the VMM process itself.
///
/// No per-thread information exists yet, so the whole process is pinned:
/// a strict single-node NUMA binding wins, then the automatic node-local
/// mask, then the emulator pin, then the VM-wide mask, then all online
/// CPUs.
pub fn init_cpu_affinity(vm: &VmInstance) -> VmResult<()> {
    if vm.pid == 0 {
        return Err(VmError::Internal(
            "cannot set up CPU affinity until the VMM process is started".into(),
        ));
    }

    let mask = initial_affinity_mask(vm)?;
    set_affinity(vm.pid, &mask)
}

fn initial_affinity_mask(vm: &VmInstance) -> VmResult<CpuSet> {
    if let Some(tune) = &vm.config.numatune {
        if vm.config.numa_node_count() <= 1 && tune.mode == super::config::NumaMode::Strict {
            if let Some(nodes) = tune
                .nodeset
                .clone()
                .or_else(|| vm.auto_nodeset.clone())
                .filter(|n| !n.is_empty())
            {
                return cpuset::nodeset_to_cpus(&nodes);
            }
        }
    }
    if vm.config.placement_mode == PlacementMode::Auto {
        if let Some(mask) = vm.auto_cpuset.as_ref().filter(|m| !m.is_empty()) {
            return Ok(mask.clone());
        }
    }
    if let Some(pin) = vm
        .config
        .cputune
        .emulatorpin
        .as_ref()
        .filter(|m| !m.is_empty())
    {
        return Ok(pin.clone());
    }
    if let Some(mask) = vm.config.cpumask.as_ref().filter(|m| !m.is_empty()) {
        return Ok(mask.clone());
    }
    cpuset::host_online_cpus()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroups::CgroupManager;
    use crate::vm::config::{SchedPolicy, VirtType, VmConfig};

    fn test_vm() -> VmInstance {
        let config = VmConfig {
            name: "guest0".into(),
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

    fn vm_with_cgroup(controllers: &[Controller]) -> (tempfile::TempDir, VmInstance) {
        let dir = tempfile::tempdir().unwrap();
        let manager = CgroupManager::with_root(dir.path().join("vmshepherd"), controllers).unwrap();
        let mut vm = test_vm();
        vm.id = 1;
        vm.cgroup = Some(manager.create_vm_root("1-guest0").unwrap());
        (dir, vm)
    }

    fn own_tid() -> i32 {
        // SAFETY: gettid has no preconditions.
        unsafe { libc::gettid() }
    }

    fn current_affinity() -> CpuSet {
        let set = nix::sched::sched_getaffinity(nix::unistd::Pid::from_raw(0)).unwrap();
        CpuSet::from_sched_set(&set)
    }

    #[test]
    fn test_mask_resolution_priority_order() {
        let mut vm = test_vm();
        let explicit = CpuSet::from_indices([1]);
        let auto = CpuSet::from_indices([2]);
        let vm_wide = CpuSet::from_indices([3]);

        vm.config.placement_mode = PlacementMode::Auto;
        vm.auto_cpuset = Some(auto.clone());
        vm.config.cpumask = Some(vm_wide.clone());

        // Explicit beats everything.
        let plan = resolve_masks(&vm, Some(&explicit)).unwrap();
        assert_eq!(plan.cgroup_mask, Some(explicit.clone()));
        assert_eq!(plan.affinity_mask, Some(explicit));

        // Auto placement beats the VM-wide mask.
        let plan = resolve_masks(&vm, None).unwrap();
        assert_eq!(plan.cgroup_mask, Some(auto));

        // VM-wide mask when not in auto mode.
        vm.config.placement_mode = PlacementMode::Static;
        let plan = resolve_masks(&vm, None).unwrap();
        assert_eq!(plan.cgroup_mask, Some(vm_wide));

        // Nothing configured: no cpuset write, affinity explicit to all
        // online host CPUs.
        vm.config.cpumask = None;
        let plan = resolve_masks(&vm, None).unwrap();
        assert!(plan.cgroup_mask.is_none());
        let host = cpuset::host_online_cpus().unwrap();
        assert_eq!(plan.affinity_mask, Some(host));
    }

    #[test]
    fn test_empty_explicit_mask_falls_through() {
        let mut vm = test_vm();
        let vm_wide = CpuSet::from_indices([3]);
        vm.config.cpumask = Some(vm_wide.clone());
        let empty = CpuSet::new();
        let plan = resolve_masks(&vm, Some(&empty)).unwrap();
        assert_eq!(plan.cgroup_mask, Some(vm_wide));
    }

    #[test]
    fn test_bandwidth_requires_cpu_controller() {
        // No cgroup at all.
        let vm = test_vm();
        let mask = current_affinity();
        let request = PlacementRequest {
            class: ThreadClass::Vcpu,
            index: 0,
            tid: own_tid(),
            cpumask: Some(&mask),
            bandwidth: CpuBandwidth::new(100_000, 50_000),
            sched: None,
        };
        assert!(matches!(
            place_thread(&vm, &request),
            Err(VmError::ConfigUnsupported(_))
        ));

        // Cpuset controller alone does not satisfy the requirement.
        let (_dir, vm) = vm_with_cgroup(&[Controller::Cpuset]);
        assert!(matches!(
            place_thread(&vm, &request),
            Err(VmError::ConfigUnsupported(_))
        ));
    }

    #[test]
    fn test_place_thread_writes_cgroup_and_exact_affinity() {
        let (_dir, vm) = vm_with_cgroup(&[Controller::Cpu, Controller::Cpuset]);
        let mask = current_affinity();
        assert!(!mask.is_empty());

        let request = PlacementRequest {
            class: ThreadClass::Vcpu,
            index: 2,
            tid: own_tid(),
            cpumask: Some(&mask),
            bandwidth: CpuBandwidth::new(100_000, 50_000),
            sched: None,
        };
        place_thread(&vm, &request).unwrap();

        let cgroup_path = vm.cgroup.as_ref().unwrap().path().join("vcpu2");
        assert_eq!(
            std::fs::read_to_string(cgroup_path.join("cgroup.threads")).unwrap(),
            own_tid().to_string()
        );
        assert_eq!(
            std::fs::read_to_string(cgroup_path.join("cpuset.cpus")).unwrap(),
            mask.to_string()
        );
        assert_eq!(
            std::fs::read_to_string(cgroup_path.join("cpu.max")).unwrap(),
            "50000 100000"
        );

        // The thread's affinity is exactly the requested set.
        assert_eq!(current_affinity(), mask);
    }

    #[test]
    fn test_affinity_applies_without_any_cgroup() {
        let vm = test_vm();
        let mask = current_affinity();
        let request = PlacementRequest {
            class: ThreadClass::IoThread,
            index: 7,
            tid: own_tid(),
            cpumask: Some(&mask),
            bandwidth: CpuBandwidth::default(),
            sched: None,
        };
        place_thread(&vm, &request).unwrap();
        assert_eq!(current_affinity(), mask);
    }

    #[test]
    fn test_failed_placement_removes_created_cgroup() {
        let (_dir, vm) = vm_with_cgroup(&[Controller::Cpu, Controller::Cpuset]);
        let mask = current_affinity();
        // A tid that cannot exist: the affinity call fails with ESRCH after
        // the cgroup was created and written.
        let request = PlacementRequest {
            class: ThreadClass::Vcpu,
            index: 0,
            tid: i32::MAX,
            cpumask: Some(&mask),
            bandwidth: CpuBandwidth::default(),
            sched: None,
        };
        assert!(place_thread(&vm, &request).is_err());
        let cgroup_path = vm.cgroup.as_ref().unwrap().path().join("vcpu0");
        assert!(!cgroup_path.exists());
    }

    #[test]
    fn test_scheduler_suppressed_for_emulator_class() {
        // A Fifo directive on the emulator class must be ignored; the call
        // succeeds without touching the scheduler even unprivileged.
        let vm = test_vm();
        let mask = current_affinity();
        let sched = SchedulerDirective {
            policy: SchedPolicy::Fifo,
            priority: 99,
        };
        let request = PlacementRequest {
            class: ThreadClass::Emulator,
            index: 0,
            tid: own_tid(),
            cpumask: Some(&mask),
            bandwidth: CpuBandwidth::default(),
            sched: Some(&sched),
        };
        place_thread(&vm, &request).unwrap();
    }

    #[test]
    fn test_initial_affinity_prefers_emulatorpin() {
        let mut vm = test_vm();
        let pin = CpuSet::from_indices([0]);
        vm.config.cputune.emulatorpin = Some(pin.clone());
        vm.config.cpumask = Some(CpuSet::from_indices([1]));
        assert_eq!(initial_affinity_mask(&vm).unwrap(), pin);
    }

    #[test]
    fn test_initial_affinity_requires_running_process() {
        let vm = test_vm();
        assert!(matches!(
            init_cpu_affinity(&vm),
            Err(VmError::Internal(_))
        ));
    }
}
