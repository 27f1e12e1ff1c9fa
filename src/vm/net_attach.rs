//! Network-attach protocol client
//!
//! Guest NICs are wired into a running VMM by sending one add-net request
//! per interface over the VMM's API socket, with the interface's tap file
//! descriptors attached to the request as SCM_RIGHTS ancillary data. The
//! VMM duplicates the descriptors on receipt, so the local copies are
//! closed immediately after each transfer attempt, successful or not.
//!
//! Requests are strictly sequential: the VMM serializes control requests
//! on one connection, and each response is awaited (with a bounded poll)
//! before the next interface is attached.

use std::io::IoSlice;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{recv, sendmsg, ControlMessage, MsgFlags, UnixAddr};
use tracing::debug;

use crate::driver::DriverCaps;
use crate::error::{VmError, VmResult};
use crate::net::NetworkSetup;
use crate::vm::config::NetDef;

const ADD_NET_PATH: &str = "/api/v1/vm.add-net";

/// How long to wait for the VMM's response to one add-net request. A
/// non-responsive control channel means the VMM is unhealthy; there is no
/// retry.
const RESPONSE_TIMEOUT_MS: libc::c_int = 500;

const RECV_BUF_LEN: usize = 1024;

/// Attach every configured guest network to the VMM.
///
/// Returns the kernel interface indexes of the host-side devices, in
/// configuration order.
pub fn attach_networks(
    caps: &DriverCaps,
    socket_path: &Path,
    nets: &[NetDef],
    net_setup: &dyn NetworkSetup,
) -> VmResult<Vec<i32>> {
    if !caps.net_fd_passing {
        return Err(VmError::ConfigUnsupported(
            "guest networking is not supported by this VMM".into(),
        ));
    }

    let sock = UnixStream::connect(socket_path).map_err(|e| {
        VmError::system(format!("connect to VMM socket {}", socket_path.display()), e)
    })?;

    let mut nic_indexes = Vec::with_capacity(nets.len());
    for net in nets {
        net_setup.validate_actual(net)?;

        let allocation = net_setup.allocate_taps(net)?;
        nic_indexes.push(allocation.ifindex);

        let payload = net_setup.build_net_request(net)?;
        debug!(net = %net.id, %payload, "sending add-net request");
        let request = frame_request(&payload);

        let sent = send_with_fds(&sock, request.as_bytes(), &allocation.fds);
        // The fds were duplicated by the VMM, or the attempt is abandoned;
        // either way the local copies are done.
        drop(allocation);
        sent?;

        let response = socket_recv(&sock)?;
        let status = parse_http_status(&response).ok_or_else(|| {
            VmError::Internal("failed to parse HTTP response status from VMM".into())
        })?;
        if status != 204 && status != 200 {
            return Err(VmError::Internal(format!(
                "unexpected response from VMM for net '{}': {status}",
                net.id
            )));
        }
    }
    Ok(nic_indexes)
}

/// Frame one add-net request: request line, headers with an explicit
/// content length, blank line, body.
fn frame_request(body: &str) -> String {
    format!(
        "PUT {ADD_NET_PATH} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

/// Transmit the framed request and the tap fds as one kernel message.
fn send_with_fds(sock: &UnixStream, payload: &[u8], fds: &[OwnedFd]) -> VmResult<()> {
    let raw_fds: Vec<RawFd> = fds.iter().map(|f| f.as_raw_fd()).collect();
    let iov = [IoSlice::new(payload)];
    let cmsgs = [ControlMessage::ScmRights(&raw_fds)];

    let sent = loop {
        match sendmsg::<UnixAddr>(
            sock.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            None,
        ) {
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(VmError::errno("send add-net request with tap fds", e)),
            Ok(n) => break n,
        }
    };
    if sent != payload.len() {
        return Err(VmError::Internal(format!(
            "short write sending add-net request: {sent} of {} bytes",
            payload.len()
        )));
    }
    Ok(())
}

/// Receive one response with a bounded wait.
fn socket_recv(sock: &UnixStream) -> VmResult<String> {
    let mut pollfds = [PollFd::new(sock, PollFlags::POLLIN)];
    let ready = loop {
        match poll(&mut pollfds, RESPONSE_TIMEOUT_MS) {
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(VmError::errno("poll on VMM socket", e)),
            Ok(n) => break n,
        }
    };
    if ready == 0 {
        return Err(VmError::system(
            "poll on VMM socket timed out",
            std::io::Error::from_raw_os_error(libc::ETIMEDOUT),
        ));
    }

    let mut buf = [0u8; RECV_BUF_LEN];
    let received = loop {
        match recv(sock.as_raw_fd(), &mut buf, MsgFlags::empty()) {
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(VmError::errno("recv on VMM socket", e)),
            Ok(n) => break n,
        }
    };
    Ok(String::from_utf8_lossy(&buf[..received]).into_owned())
}

/// Extract the numeric status code from a response line of the form
/// `HTTP/1.<minor> <code> ...`.
fn parse_http_status(response: &str) -> Option<u16> {
    let rest = response.strip_prefix("HTTP/1.")?;
    let minor_len = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
    if minor_len == 0 {
        return None;
    }
    let rest = &rest[minor_len..];
    let after_space = rest.trim_start_matches(' ');
    if after_space.len() == rest.len() {
        // No separator between version and code.
        return None;
    }
    let code: String = after_space
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if code.is_empty() {
        return None;
    }
    code.parse().ok()
}
