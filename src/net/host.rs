//! Tap-device backed implementation of [`NetworkSetup`]
//!
//! Opens `/dev/net/tun` once per queue pair and binds every fd to the same
//! interface name with `IFF_MULTI_QUEUE`, which is how a multiqueue virtio
//! NIC gets one tap fd per queue pair. Link state is driven through
//! `ip(8)`, the same way the guest-facing tooling around this controller
//! manages addresses and routes.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::process::Command;

use tracing::{debug, warn};

use super::{NetworkSetup, TapAllocation};
use crate::error::{VmError, VmResult};
use crate::vm::config::NetDef;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_VNET_HDR: libc::c_short = 0x4000;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;

#[repr(C)]
struct IfReqFlags {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

pub struct TapNetworkSetup;

impl TapNetworkSetup {
    pub fn new() -> Self {
        Self
    }

    fn open_tap_queue(&self, ifname: &str, multi_queue: bool) -> VmResult<OwnedFd> {
        let tun = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(|e| VmError::system("open /dev/net/tun", e))?;

        let mut flags = IFF_TAP | IFF_NO_PI | IFF_VNET_HDR;
        if multi_queue {
            flags |= IFF_MULTI_QUEUE;
        }
        let mut req = IfReqFlags {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: flags,
            _pad: [0; 22],
        };
        let name_bytes = ifname.as_bytes();
        if name_bytes.len() >= libc::IFNAMSIZ {
            return Err(VmError::Internal(format!(
                "tap interface name '{ifname}' too long"
            )));
        }
        req.ifr_name[..name_bytes.len()].copy_from_slice(name_bytes);

        // SAFETY: req outlives the call and matches the TUNSETIFF layout.
        let rc = unsafe { libc::ioctl(tun.as_raw_fd(), TUNSETIFF, &req) };
        if rc < 0 {
            return Err(VmError::system(
                format!("ioctl(TUNSETIFF) for '{ifname}'"),
                std::io::Error::last_os_error(),
            ));
        }
        Ok(tun.into())
    }

    fn ifindex(&self, ifname: &str) -> VmResult<i32> {
        let path = format!("/sys/class/net/{ifname}/ifindex");
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| VmError::system(format!("read {path}"), e))?;
        raw.trim()
            .parse()
            .map_err(|_| VmError::Internal(format!("unparseable ifindex for '{ifname}'")))
    }

    fn ip_link(&self, args: &[&str]) -> VmResult<()> {
        let status = Command::new("ip")
            .arg("link")
            .args(args)
            .status()
            .map_err(|e| VmError::system("spawn ip(8)", e))?;
        if !status.success() {
            return Err(VmError::Internal(format!(
                "ip link {} failed with {status}",
                args.join(" ")
            )));
        }
        Ok(())
    }
}

impl Default for TapNetworkSetup {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkSetup for TapNetworkSetup {
    fn validate_actual(&self, net: &NetDef) -> VmResult<()> {
        if net.mac.split(':').count() != 6 {
            return Err(VmError::Internal(format!(
                "net '{}' has malformed mac '{}'",
                net.id, net.mac
            )));
        }
        if net.tap_name().len() >= libc::IFNAMSIZ {
            return Err(VmError::Internal(format!(
                "net '{}' tap name too long",
                net.id
            )));
        }
        Ok(())
    }

    fn allocate_taps(&self, net: &NetDef) -> VmResult<TapAllocation> {
        let ifname = net.tap_name();
        let pairs = net.queue_pairs();
        let multi_queue = pairs > 1;

        let mut fds = Vec::with_capacity(pairs as usize);
        for _ in 0..pairs {
            fds.push(self.open_tap_queue(&ifname, multi_queue)?);
        }
        let ifindex = self.ifindex(&ifname)?;
        debug!(net = %net.id, %ifname, ifindex, queues = pairs, "allocated tap queues");
        Ok(TapAllocation { fds, ifindex })
    }

    fn start_devices(&self, nets: &[NetDef]) -> VmResult<()> {
        for net in nets {
            let ifname = net.tap_name();
            self.ip_link(&["set", "dev", &ifname, "up"])?;
            if let Some(mtu) = net.mtu {
                self.ip_link(&["set", "dev", &ifname, "mtu", &mtu.to_string()])?;
            }
        }
        Ok(())
    }

    fn stop_devices(&self, nets: &[NetDef]) {
        for net in nets {
            let ifname = net.tap_name();
            if let Err(e) = self.ip_link(&["set", "dev", &ifname, "down"]) {
                warn!(net = %net.id, %ifname, error = %e, "failed to bring tap down");
            }
        }
    }

    fn delete_device(&self, net: &NetDef, _state_dir: &Path) {
        let ifname = net.tap_name();
        if let Err(e) = self.ip_link(&["del", "dev", &ifname]) {
            warn!(net = %net.id, %ifname, error = %e, "failed to delete tap device");
        }
    }
}
