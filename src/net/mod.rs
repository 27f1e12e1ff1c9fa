//! Host-side network setup for guest interfaces
//!
//! The lifecycle controller hands guest traffic to the VMM through tap
//! devices. This module owns everything on the host side of that handoff:
//! allocating tap queues, serializing the add-net request body, and
//! bringing interfaces up and down around boot and teardown.

pub mod host;

use std::os::fd::OwnedFd;
use std::path::Path;

use serde::Serialize;

use crate::error::{VmError, VmResult};
use crate::vm::config::NetDef;

pub use host::TapNetworkSetup;

/// Tap file descriptors allocated for one guest interface, plus the kernel
/// interface index of the host-side device.
///
/// The descriptors are owned here only until they are transferred to the
/// VMM (which duplicates them); dropping the allocation closes every local
/// copy, on success and failure paths alike.
#[derive(Debug)]
pub struct TapAllocation {
    pub fds: Vec<OwnedFd>,
    pub ifindex: i32,
}

/// Host network operations consumed by the orchestrators and the
/// network-attach client.
pub trait NetworkSetup: Send + Sync {
    /// Check the resolved ("actual") form of a network definition before
    /// any host state is created for it.
    fn validate_actual(&self, net: &NetDef) -> VmResult<()>;

    /// Allocate one tap fd per requested queue pair and report the
    /// interface index of the created device.
    fn allocate_taps(&self, net: &NetDef) -> VmResult<TapAllocation>;

    /// Serialize a network definition to the VMM's add-net request body.
    fn build_net_request(&self, net: &NetDef) -> VmResult<String> {
        build_net_request_body(net)
    }

    /// Bring host-side devices up before the guest boots.
    fn start_devices(&self, nets: &[NetDef]) -> VmResult<()>;

    /// Bring host-side devices down. Best-effort; used during teardown.
    fn stop_devices(&self, nets: &[NetDef]);

    /// Remove host-side state for one interface. Best-effort.
    fn delete_device(&self, net: &NetDef, state_dir: &Path);
}

/// Wire shape of the VMM's add-net request body. `num_queues` counts
/// rx/tx queues, i.e. two per queue pair.
#[derive(Serialize)]
struct NetRequestBody<'a> {
    id: &'a str,
    tap: String,
    mac: &'a str,
    num_queues: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    mtu: Option<u16>,
}

pub(crate) fn build_net_request_body(net: &NetDef) -> VmResult<String> {
    let body = NetRequestBody {
        id: &net.id,
        tap: net.tap_name(),
        mac: &net.mac,
        num_queues: net.queue_pairs() * 2,
        mtu: net.mtu,
    };
    serde_json::to_string(&body)
        .map_err(|e| VmError::Internal(format!("failed to build net json for '{}': {e}", net.id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(queues: u32) -> NetDef {
        NetDef {
            id: "net0".into(),
            mac: "52:54:00:aa:bb:cc".into(),
            ifname: Some("vmtap0".into()),
            queues,
            mtu: None,
        }
    }

    #[test]
    fn test_request_body_doubles_queue_pairs() {
        let body = build_net_request_body(&net(2)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["num_queues"], 4);
        assert_eq!(parsed["tap"], "vmtap0");
        assert_eq!(parsed["mac"], "52:54:00:aa:bb:cc");
    }

    #[test]
    fn test_request_body_unset_queues_mean_one_pair() {
        let body = build_net_request_body(&net(0)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["num_queues"], 2);
        assert!(parsed.get("mtu").is_none());
    }
}
