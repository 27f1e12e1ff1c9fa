//! Start and Stop orchestrators
//!
//! [`start`] sequences one VM from Shutoff to Running: validation, monitor
//! connection and guest creation, network attachment with fd passing,
//! cgroup construction, initial affinity, host netdev bring-up, boot, and
//! per-class thread placement. Failure at any step tears down everything
//! acquired so far through [`stop`] and surfaces the originating error.
//!
//! [`stop`] never fails. Every constituent action is best-effort so that a
//! VM always reaches Shutoff, even when the kernel is slow to release its
//! cgroup hierarchy.

use std::time::Instant;

use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use super::config::{ChrSource, VirtType, VmConfig};
use super::instance::{RunningReason, ShutoffReason, VmInstance, VmState};
use super::monitor::{HttpMonitor, VmMonitor};
use super::net_attach;
use super::placement::{self, PlacementRequest};
use super::threads::{self, ThreadClass};
use crate::cgroups::{CgroupManager, Controller};
use crate::driver::Driver;
use crate::error::{VmError, VmResult};
use crate::metrics;
use crate::net::NetworkSetup;

/// Bound on cgroup-removal retries when the hierarchy is still busy.
const CGROUP_REMOVE_RETRIES: u32 = 5;
const CGROUP_REMOVE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Take a VM from Shutoff to Running.
///
/// The caller serializes start/stop per VM; this function assumes it is
/// the only lifecycle operation running for `vm`.
pub async fn start(
    driver: &Driver,
    vm: &mut VmInstance,
    net_setup: &dyn NetworkSetup,
    reason: RunningReason,
) -> VmResult<()> {
    let begin = Instant::now();

    if vm.is_active() {
        return Err(VmError::OperationInvalid("VM is already active".into()));
    }
    validate_start(driver, vm)?;

    match run_start_sequence(driver, vm, net_setup).await {
        Ok(()) => {
            vm.state = VmState::Running(reason);
            metrics::VM_STARTS_TOTAL.inc();
            metrics::VM_START_DURATION.observe(begin.elapsed().as_secs_f64());
            info!(vm = %vm.config.name, pid = vm.pid, "VM is running");
            Ok(())
        }
        Err(e) => {
            metrics::VM_START_FAILURES_TOTAL.inc();
            Err(e)
        }
    }
}

/// Everything between validation and the Running transition. Each step
/// that fails rolls the VM back through [`stop`] before returning, with
/// one exception noted inline.
async fn run_start_sequence(
    driver: &Driver,
    vm: &mut VmInstance,
    net_setup: &dyn NetworkSetup,
) -> VmResult<()> {
    // Connect the monitor and create the guest only when no connection
    // exists yet; a re-entered start must not reopen the channel.
    if vm.monitor.is_none() {
        let connected = HttpMonitor::connect(
            &vm.config,
            &driver.config.state_dir,
            &driver.config.vmm_binary,
        )
        .await;
        let monitor = match connected {
            Ok(monitor) => monitor,
            Err(e) => return Err(cleanup_failed_start(driver, vm, net_setup, e).await),
        };
        let created = monitor.create_vm(&vm.config).await;
        vm.monitor = Some(Box::new(monitor));
        if let Err(e) = created {
            return Err(cleanup_failed_start(driver, vm, net_setup, e).await);
        }
    }

    // The externally visible pid goes straight from 0 to the observed VMM
    // pid; the machine name for cgroup scoping derives from it.
    let (pid, socket_path) = {
        let monitor = monitor_of(vm)?;
        (monitor.pid(), monitor.socket_path().to_path_buf())
    };
    vm.pid = pid;
    vm.id = pid;
    vm.machine_name = Some(vm.derive_machine_name());

    let attached =
        net_attach::attach_networks(&driver.caps, &socket_path, &vm.config.nets, net_setup);
    match attached {
        Ok(nic_indexes) => vm.nic_indexes = nic_indexes,
        Err(e) => return Err(cleanup_failed_start(driver, vm, net_setup, e).await),
    }

    if let Err(e) = create_vm_cgroup(driver, vm) {
        return Err(cleanup_failed_start(driver, vm, net_setup, e).await);
    }

    if let Err(e) = placement::init_cpu_affinity(vm) {
        return Err(cleanup_failed_start(driver, vm, net_setup, e).await);
    }

    // Bring up netdevs before starting vCPUs. A failure here returns
    // without the stop() rollback every other step takes; tests pin this
    // asymmetry.
    net_setup.start_devices(&vm.config.nets)?;

    let booted = monitor_of(vm)?.boot_vm().await;
    if let Err(e) = booted {
        return Err(cleanup_failed_start(driver, vm, net_setup, e).await);
    }

    // The vCPU placement pass handles an absent tid map, so a failed
    // refresh only degrades placement.
    let refreshed = vm.refresh_thread_info().await;
    if let Err(e) = refreshed {
        warn!(vm = %vm.config.name, error = %e, "failed to refresh VMM thread info");
    }

    debug!("setting emulator thread tuning");
    if let Err(e) = setup_emulator_threads(vm) {
        return Err(cleanup_failed_start(driver, vm, net_setup, e).await);
    }

    debug!("setting iothread tuning");
    if let Err(e) = setup_io_threads(vm) {
        return Err(cleanup_failed_start(driver, vm, net_setup, e).await);
    }

    debug!("setting global CPU cgroup (if required)");
    if let Err(e) = setup_global_cpu_cgroup(vm) {
        return Err(cleanup_failed_start(driver, vm, net_setup, e).await);
    }

    debug!("setting vCPU tuning");
    if let Err(e) = setup_vcpus(vm) {
        return Err(cleanup_failed_start(driver, vm, net_setup, e).await);
    }

    // Post-boot reconciliation of pty-backed console paths; best-effort.
    let info_updated = update_info(vm).await;
    if let Err(e) = info_updated {
        warn!(vm = %vm.config.name, error = %e, "failed to update device info from VMM");
    }

    Ok(())
}

/// Tear down a partially started VM and hand back the original error.
async fn cleanup_failed_start(
    driver: &Driver,
    vm: &mut VmInstance,
    net_setup: &dyn NetworkSetup,
    err: VmError,
) -> VmError {
    stop(driver, vm, net_setup, ShutoffReason::Failed).await;
    err
}

/// Checks done before any resource is acquired.
fn validate_start(driver: &Driver, vm: &VmInstance) -> VmResult<()> {
    match vm.config.virt_type {
        VirtType::Kvm => {
            debug!("checking for KVM availability");
            if !driver.caps.kvm {
                return Err(VmError::ConfigUnsupported(
                    "the VM requires KVM, but it is not available on this host".into(),
                ));
            }
        }
        VirtType::Hyperv => {
            debug!("checking for mshv availability");
            if !driver.caps.mshv {
                return Err(VmError::ConfigUnsupported(
                    "the VM requires the mshv device, but it is not available on this host".into(),
                ));
            }
        }
    }
    Ok(())
}

fn monitor_of(vm: &VmInstance) -> VmResult<&dyn VmMonitor> {
    vm.monitor
        .as_deref()
        .ok_or_else(|| VmError::Internal("monitor connection is missing".into()))
}

/// Build the VM's top-level cgroup, scoped by the driver's controller list
/// and the derived machine name.
fn create_vm_cgroup(driver: &Driver, vm: &mut VmInstance) -> VmResult<()> {
    let controllers = &driver.config.cgroup_controllers;
    let manager = match &driver.config.cgroup_root {
        Some(root) => CgroupManager::with_root(root, controllers),
        None => CgroupManager::new(controllers),
    }
    .map_err(|e| VmError::system("open cgroup namespace", e))?;

    let machine_name = vm
        .machine_name
        .clone()
        .ok_or_else(|| VmError::Internal("machine name not derived before cgroup setup".into()))?;
    let cgroup = manager
        .create_vm_root(&machine_name)
        .map_err(|e| VmError::system(format!("create cgroup for {machine_name}"), e))?;
    vm.cgroup = Some(cgroup);
    Ok(())
}

fn setup_emulator_threads(vm: &VmInstance) -> VmResult<()> {
    let descriptors = threads::emulator_threads(monitor_of(vm)?.threads());
    for descriptor in descriptors {
        debug!(tid = descriptor.tid, name = ?descriptor.name, "placing emulator thread");
        placement::place_thread(
            vm,
            &PlacementRequest {
                class: ThreadClass::Emulator,
                index: 0,
                tid: descriptor.tid,
                cpumask: vm.config.cputune.emulatorpin.as_ref(),
                bandwidth: vm.config.cputune.emulator,
                sched: vm.config.cputune.emulatorsched.as_ref(),
            },
        )?;
    }
    Ok(())
}

fn setup_io_threads(vm: &VmInstance) -> VmResult<()> {
    let descriptors = monitor_of(vm)?.io_threads();
    for descriptor in descriptors {
        debug!(tid = descriptor.tid, index = descriptor.index, "placing I/O thread");
        // The VMM takes no per-iothread pinning from the configuration, so
        // the automatic node-local mask is the only per-entity input.
        placement::place_thread(
            vm,
            &PlacementRequest {
                class: ThreadClass::IoThread,
                index: descriptor.index,
                tid: descriptor.tid,
                cpumask: vm.auto_cpuset.as_ref(),
                bandwidth: vm.config.cputune.iothread,
                sched: None,
            },
        )?;
    }
    Ok(())
}

/// Apply VM-wide bandwidth to the root cgroup once thread cgroups exist.
fn setup_global_cpu_cgroup(vm: &VmInstance) -> VmResult<()> {
    let bandwidth = vm.config.cputune.global;
    if !bandwidth.any_set() {
        return Ok(());
    }
    let Some(cgroup) = &vm.cgroup else {
        return Err(VmError::ConfigUnsupported(
            "cgroup cpu controller is required for bandwidth tuning".into(),
        ));
    };
    if !cgroup.has_controller(Controller::Cpu) {
        return Err(VmError::ConfigUnsupported(
            "cgroup cpu controller is required for bandwidth tuning".into(),
        ));
    }
    cgroup
        .set_bandwidth(bandwidth)
        .map_err(|e| VmError::system("write VM-wide cpu.max", e))
}

fn setup_vcpus(vm: &VmInstance) -> VmResult<()> {
    let has_cpu_controller = vm
        .cgroup
        .as_ref()
        .is_some_and(|c| c.has_controller(Controller::Cpu));
    if vm.config.cputune.vcpu.any_set() && !has_cpu_controller {
        return Err(VmError::ConfigUnsupported(
            "cgroup cpu controller is required for bandwidth tuning".into(),
        ));
    }

    if !vm.has_vcpu_pids() {
        // Per-vCPU affinity cannot be expressed without known thread ids;
        // reject any mask that differs from the VM-wide mask, otherwise
        // there is nothing to do.
        for vcpu in vm.config.online_vcpus() {
            if let Some(mask) = &vcpu.cpumask {
                if Some(mask) != vm.config.cpumask.as_ref() {
                    return Err(VmError::OperationInvalid(
                        "per-vCPU affinity requires known vCPU thread ids".into(),
                    ));
                }
            }
        }
        return Ok(());
    }

    for vcpu in vm.config.online_vcpus() {
        let tid = vm.vcpu_pid(vcpu.id).ok_or_else(|| {
            VmError::Internal(format!("no thread id reported for vCPU {}", vcpu.id))
        })?;
        placement::place_thread(
            vm,
            &PlacementRequest {
                class: ThreadClass::Vcpu,
                index: vcpu.id,
                tid,
                cpumask: vcpu.cpumask.as_ref(),
                bandwidth: vm.config.cputune.vcpu,
                sched: vcpu.sched.as_ref(),
            },
        )?;
    }
    Ok(())
}

/// Reconcile guest-exposed device paths with the configuration.
async fn update_info(vm: &mut VmInstance) -> VmResult<()> {
    let info = monitor_of(vm)?.get_info().await?;
    update_console_paths(&mut vm.config, &info);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleKind {
    Console,
    Serial,
}

impl ConsoleKind {
    fn key(self) -> &'static str {
        match self {
            ConsoleKind::Console => "console",
            ConsoleKind::Serial => "serial",
        }
    }
}

/// Capture pty paths the VMM allocated for console/serial devices.
fn update_console_paths(config: &mut VmConfig, info: &serde_json::Value) {
    let Some(guest_config) = info.get("config") else {
        error!("missing 'config' in info query result from VMM");
        return;
    };
    if config.console.is_some() {
        update_console_device(config, guest_config, ConsoleKind::Console);
    }
    if config.serial.is_some() {
        update_console_device(config, guest_config, ConsoleKind::Serial);
    }
}

fn update_console_device(
    config: &mut VmConfig,
    guest_config: &serde_json::Value,
    kind: ConsoleKind,
) {
    let chr = match kind {
        ConsoleKind::Console => config.console.as_mut(),
        ConsoleKind::Serial => config.serial.as_mut(),
    };
    let Some(chr) = chr else { return };

    // A serial device on a pre-negotiated socket transport needs no pty
    // extraction.
    if kind == ConsoleKind::Serial && matches!(chr.source, ChrSource::Unix { .. }) {
        return;
    }

    let Some(device) = guest_config.get(kind.key()) else {
        error!(device = kind.key(), "missing device entry in 'config' from VMM");
        return;
    };
    let Some(file) = device.get("file").and_then(|f| f.as_str()) else {
        error!(device = kind.key(), "missing or unparseable 'file' in device entry from VMM");
        return;
    };

    if let ChrSource::Pty { path } = &mut chr.source {
        *path = Some(file.into());
    }
}

/// Take a VM to Shutoff, releasing everything it holds. Idempotent and
/// infallible: failures are logged and teardown continues.
pub async fn stop(
    driver: &Driver,
    vm: &mut VmInstance,
    net_setup: &dyn NetworkSetup,
    reason: ShutoffReason,
) {
    debug!(vm = %vm.config.name, pid = vm.pid, ?reason, "stopping VM");

    if let Some(monitor) = vm.monitor.take() {
        monitor.close();
    }

    // Netdevs come down after the VMM is gone.
    net_setup.stop_devices(&vm.config.nets);
    for net in &vm.config.nets {
        net_setup.delete_device(net, &driver.config.state_dir);
    }

    if let Some(cgroup) = vm.cgroup.take() {
        let machine = vm
            .machine_name
            .clone()
            .unwrap_or_else(|| vm.config.name.clone());
        remove_cgroup_with_retry(|| cgroup.remove(), &machine, CGROUP_REMOVE_RETRY_DELAY).await;
    }

    vm.pid = 0;
    vm.id = -1;
    vm.machine_name = None;
    vm.vcpu_pids.clear();
    vm.nic_indexes.clear();
    vm.state = VmState::Shutoff(reason);
    metrics::VM_STOPS_TOTAL.inc();
}

/// Remove a cgroup hierarchy, retrying a bounded number of times while the
/// kernel reports it busy. Gives up with a warning after the bound; a
/// lingering empty cgroup must not block reaching Shutoff.
async fn remove_cgroup_with_retry<F>(mut remove: F, machine: &str, delay: Duration)
where
    F: FnMut() -> std::io::Result<()>,
{
    let mut retries = 0;
    loop {
        match remove() {
            Ok(()) => return,
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && retries < CGROUP_REMOVE_RETRIES => {
                retries += 1;
                metrics::CGROUP_REMOVE_RETRIES_TOTAL.inc();
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(%machine, error = %e, "failed to remove VM cgroup");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cgroup_removal_retries_five_times_on_persistent_busy() {
        let mut attempts = 0u32;
        remove_cgroup_with_retry(
            || {
                attempts += 1;
                Err(std::io::Error::from_raw_os_error(libc::EBUSY))
            },
            "test-machine",
            Duration::ZERO,
        )
        .await;
        // The initial attempt plus exactly five retries.
        assert_eq!(attempts, 6);
    }

    #[tokio::test]
    async fn test_cgroup_removal_does_not_retry_other_errors() {
        let mut attempts = 0u32;
        remove_cgroup_with_retry(
            || {
                attempts += 1;
                Err(std::io::Error::from_raw_os_error(libc::ENOENT))
            },
            "test-machine",
            Duration::ZERO,
        )
        .await;
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_cgroup_removal_stops_retrying_on_success() {
        let mut attempts = 0u32;
        remove_cgroup_with_retry(
            || {
                attempts += 1;
                if attempts < 3 {
                    Err(std::io::Error::from_raw_os_error(libc::EBUSY))
                } else {
                    Ok(())
                }
            },
            "test-machine",
            Duration::ZERO,
        )
        .await;
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_console_path_update_from_info() {
        let mut config = test_config();
        config.console = Some(super::super::config::ChrDef {
            source: ChrSource::Pty { path: None },
        });
        config.serial = Some(super::super::config::ChrDef {
            source: ChrSource::Unix {
                path: "/run/serial.sock".into(),
            },
        });

        let info = serde_json::json!({
            "config": {
                "console": { "mode": "Pty", "file": "/dev/pts/3" },
                "serial": { "mode": "Pty", "file": "/dev/pts/4" }
            }
        });
        update_console_paths(&mut config, &info);

        match &config.console.as_ref().unwrap().source {
            ChrSource::Pty { path } => {
                assert_eq!(path.as_deref(), Some(std::path::Path::new("/dev/pts/3")));
            }
            other => panic!("unexpected console source {other:?}"),
        }
        // Socket-backed serial is left untouched.
        assert_eq!(
            config.serial.as_ref().unwrap().source,
            ChrSource::Unix {
                path: "/run/serial.sock".into()
            }
        );
    }

    #[test]
    fn test_console_path_update_tolerates_missing_fields() {
        let mut config = test_config();
        config.console = Some(super::super::config::ChrDef {
            source: ChrSource::Pty { path: None },
        });
        update_console_paths(&mut config, &serde_json::json!({}));
        update_console_paths(&mut config, &serde_json::json!({ "config": {} }));
        match &config.console.as_ref().unwrap().source {
            ChrSource::Pty { path } => assert!(path.is_none()),
            other => panic!("unexpected console source {other:?}"),
        }
    }

    fn test_config() -> VmConfig {
        VmConfig {
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
        }
    }
}
