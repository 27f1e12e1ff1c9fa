//! Monitor: the control channel to one VMM process
//!
//! [`VmMonitor`] is the narrow contract the orchestrators program against:
//! the VMM's pid, its API socket path, its current thread list, and the
//! create/boot/info commands. [`HttpMonitor`] is the real implementation:
//! it spawns the cloud-hypervisor child with `--api-socket`, waits for the
//! socket to appear, and drives the REST API over a Unix domain socket.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Instant;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::Serialize;
use tokio::time::Duration;
use tracing::{debug, warn};

use super::config::{ChrSource, VmConfig};
use super::threads::{MonitorThread, ThreadDescriptor};
use crate::error::{VmError, VmResult};

type HyperClient = Client<UnixConnector, Full<Bytes>>;

const API_VM_CREATE: &str = "/api/v1/vm.create";
const API_VM_BOOT: &str = "/api/v1/vm.boot";
const API_VM_INFO: &str = "/api/v1/vm.info";

/// How long to wait for the freshly spawned VMM to expose its API socket.
const API_SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Control-channel contract consumed by the orchestrators.
#[async_trait]
pub trait VmMonitor: Send {
    /// Pid of the VMM process behind this connection.
    fn pid(&self) -> i32;

    /// Path of the VMM's API socket; the network-attach client opens its
    /// own connection to it for fd passing.
    fn socket_path(&self) -> &Path;

    /// The VMM threads discovered by the last [`refresh_threads`] call.
    ///
    /// [`refresh_threads`]: VmMonitor::refresh_threads
    fn threads(&self) -> &[MonitorThread];

    fn nthreads(&self) -> usize {
        self.threads().len()
    }

    /// Ask the VMM to create the guest from its configuration.
    async fn create_vm(&self, config: &VmConfig) -> VmResult<()>;

    /// Boot the created guest.
    async fn boot_vm(&self) -> VmResult<()>;

    /// Fetch the VMM's info document (guest config, device paths).
    async fn get_info(&self) -> VmResult<serde_json::Value>;

    /// Re-discover the VMM's OS threads.
    async fn refresh_threads(&mut self) -> VmResult<()>;

    /// I/O thread descriptors from the current thread view.
    fn io_threads(&self) -> Vec<ThreadDescriptor> {
        super::threads::io_threads(self.threads())
    }

    /// Tear down the connection and the VMM process behind it.
    fn close(self: Box<Self>);
}

/// Guest configuration payload for `vm.create`.
#[derive(Serialize)]
struct ApiVmConfig {
    cpus: ApiCpusConfig,
    memory: ApiMemoryConfig,
    payload: ApiPayloadConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    disks: Vec<ApiDiskConfig>,
    console: ApiConsoleConfig,
    serial: ApiConsoleConfig,
}

#[derive(Serialize)]
struct ApiCpusConfig {
    boot_vcpus: u32,
    max_vcpus: u32,
}

#[derive(Serialize)]
struct ApiMemoryConfig {
    size: u64,
}

#[derive(Serialize)]
struct ApiPayloadConfig {
    kernel: PathBuf,
    #[serde(skip_serializing_if = "String::is_empty")]
    cmdline: String,
}

#[derive(Serialize)]
struct ApiDiskConfig {
    path: PathBuf,
    readonly: bool,
}

#[derive(Serialize)]
struct ApiConsoleConfig {
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    socket: Option<PathBuf>,
}

impl ApiConsoleConfig {
    fn from_chr(chr: Option<&super::config::ChrDef>) -> Self {
        match chr.map(|c| &c.source) {
            Some(ChrSource::Pty { .. }) => Self {
                mode: "Pty",
                socket: None,
            },
            Some(ChrSource::Unix { path }) => Self {
                mode: "Socket",
                socket: Some(path.clone()),
            },
            None => Self {
                mode: "Off",
                socket: None,
            },
        }
    }
}

fn build_create_payload(config: &VmConfig) -> VmResult<String> {
    let vcpus = config.vcpus.len().max(1) as u32;
    let payload = ApiVmConfig {
        cpus: ApiCpusConfig {
            boot_vcpus: config.online_vcpus().count().max(1) as u32,
            max_vcpus: vcpus,
        },
        memory: ApiMemoryConfig {
            size: config.memory_bytes,
        },
        payload: ApiPayloadConfig {
            kernel: config.kernel.clone(),
            cmdline: config.cmdline.clone(),
        },
        disks: config
            .disks
            .iter()
            .map(|d| ApiDiskConfig {
                path: d.path.clone(),
                readonly: d.readonly,
            })
            .collect(),
        console: ApiConsoleConfig::from_chr(config.console.as_ref()),
        serial: ApiConsoleConfig::from_chr(config.serial.as_ref()),
    };
    serde_json::to_string(&payload)
        .map_err(|e| VmError::Internal(format!("failed to build vm.create payload: {e}")))
}

/// Monitor implementation over the VMM's REST API socket.
pub struct HttpMonitor {
    child: Child,
    pid: i32,
    socket_path: PathBuf,
    client: HyperClient,
    threads: Vec<MonitorThread>,
}

impl HttpMonitor {
    /// Spawn the VMM for `config` and wait until its API socket accepts
    /// requests.
    pub async fn connect(config: &VmConfig, state_dir: &Path, binary: &Path) -> VmResult<Self> {
        std::fs::create_dir_all(state_dir)
            .map_err(|e| VmError::system(format!("create state dir {}", state_dir.display()), e))?;
        let socket_path = state_dir.join(format!("{}-api.sock", config.name));

        // Clean up any stale socket from a previous run.
        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }

        let child = Command::new(binary)
            .arg("--api-socket")
            .arg(&socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| VmError::system(format!("spawn VMM binary {}", binary.display()), e))?;
        let pid = child.id() as i32;

        wait_for_api_socket(&socket_path, API_SOCKET_TIMEOUT).await?;
        debug!(vm = %config.name, pid, socket = %socket_path.display(), "monitor connected");

        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);
        Ok(Self {
            child,
            pid,
            socket_path,
            client,
            threads: Vec::new(),
        })
    }

    async fn send_request(
        &self,
        method: hyper::Method,
        endpoint: &str,
        body: Option<String>,
    ) -> VmResult<Bytes> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let mut builder = hyper::Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("Content-Type", "application/json");
                Full::new(Bytes::from(json))
            }
            None => Full::new(Bytes::new()),
        };
        let req = builder
            .body(body)
            .map_err(|e| VmError::Internal(format!("failed to build request for {endpoint}: {e}")))?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| VmError::Internal(format!("request to {endpoint} failed: {e}")))?;
        let status = res.status();
        let bytes = res
            .into_body()
            .collect()
            .await
            .map_err(|e| VmError::Internal(format!("read response from {endpoint}: {e}")))?
            .to_bytes();

        if !status.is_success() {
            let detail = String::from_utf8_lossy(&bytes);
            return Err(VmError::Internal(format!(
                "{endpoint} returned {status}: {detail}"
            )));
        }
        Ok(bytes)
    }
}

#[async_trait]
impl VmMonitor for HttpMonitor {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn threads(&self) -> &[MonitorThread] {
        &self.threads
    }

    async fn create_vm(&self, config: &VmConfig) -> VmResult<()> {
        let payload = build_create_payload(config)?;
        self.send_request(hyper::Method::PUT, API_VM_CREATE, Some(payload))
            .await?;
        Ok(())
    }

    async fn boot_vm(&self) -> VmResult<()> {
        self.send_request(hyper::Method::PUT, API_VM_BOOT, None)
            .await?;
        Ok(())
    }

    async fn get_info(&self) -> VmResult<serde_json::Value> {
        let bytes = self
            .send_request(hyper::Method::GET, API_VM_INFO, None)
            .await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| VmError::Internal(format!("unparseable vm.info response: {e}")))
    }

    async fn refresh_threads(&mut self) -> VmResult<()> {
        self.threads = discover_threads(self.pid)?;
        Ok(())
    }

    fn close(mut self: Box<Self>) {
        if let Err(e) = self.child.kill() {
            // Process may already be gone.
            warn!(pid = self.pid, error = %e, "failed to kill VMM process");
        }
        let _ = self.child.wait();
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(socket = %self.socket_path.display(), error = %e,
                      "failed to remove API socket");
            }
        }
    }
}

/// Wait for the VMM's API socket to appear on disk.
async fn wait_for_api_socket(socket_path: &Path, timeout: Duration) -> VmResult<()> {
    let start = Instant::now();
    loop {
        if socket_path.exists() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            return Err(VmError::Internal(format!(
                "VMM API socket {} not ready after {timeout:?}",
                socket_path.display()
            )));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Enumerate the VMM's OS threads from /proc and classify them by name.
fn discover_threads(pid: i32) -> VmResult<Vec<MonitorThread>> {
    let task_dir = format!("/proc/{pid}/task");
    let entries = std::fs::read_dir(&task_dir)
        .map_err(|e| VmError::system(format!("read {task_dir}"), e))?;

    let mut threads = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| VmError::system(format!("read {task_dir}"), e))?;
        let Some(tid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<i32>().ok())
        else {
            continue;
        };
        // Threads can exit between readdir and the comm read.
        let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) else {
            continue;
        };
        threads.push(MonitorThread::classify(tid, comm.trim()));
    }
    Ok(threads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::config::{ChrDef, VirtType};

    fn config_with_consoles() -> VmConfig {
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
            console: Some(ChrDef {
                source: ChrSource::Pty { path: None },
            }),
            serial: Some(ChrDef {
                source: ChrSource::Unix {
                    path: "/run/guest0-serial.sock".into(),
                },
            }),
            kernel: "/vmlinux".into(),
            cmdline: "console=ttyS0".into(),
            disks: vec![],
            memory_bytes: 1 << 30,
        }
    }

    #[test]
    fn test_create_payload_shape() {
        let payload = build_create_payload(&config_with_consoles()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(v["cpus"]["boot_vcpus"], 1);
        assert_eq!(v["memory"]["size"], 1u64 << 30);
        assert_eq!(v["console"]["mode"], "Pty");
        assert_eq!(v["serial"]["mode"], "Socket");
        assert_eq!(v["serial"]["socket"], "/run/guest0-serial.sock");
        assert_eq!(v["payload"]["kernel"], "/vmlinux");
    }

    #[test]
    fn test_discover_threads_sees_own_process() {
        let threads = discover_threads(std::process::id() as i32).unwrap();
        assert!(!threads.is_empty());
        assert!(threads.iter().any(|t| t.tid == std::process::id() as i32));
    }
}
