//! vmshepherd - start one VM from a JSON config and run it until Ctrl-C

use std::process::ExitCode;

use tracing::{error, info};

use vmshepherd::net::TapNetworkSetup;
use vmshepherd::vm::{self, RunningReason, ShutoffReason, VmConfig, VmInstance};
use vmshepherd::{Driver, DriverCaps, DriverConfig};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = vmshepherd::logging::init() {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let Some(config_path) = std::env::args().nth(1) else {
        eprintln!("usage: vmshepherd <vm-config.json>");
        return ExitCode::FAILURE;
    };

    let config: VmConfig = match std::fs::read_to_string(&config_path)
        .map_err(|e| e.to_string())
        .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
    {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path, error = %e, "failed to load VM config");
            return ExitCode::FAILURE;
        }
    };

    let driver = Driver::new(DriverCaps::detect(), DriverConfig::default());
    let net_setup = TapNetworkSetup::new();
    let mut instance = VmInstance::new(config);

    if let Err(e) = vm::start(&driver, &mut instance, &net_setup, RunningReason::Booted).await {
        error!(vm = %instance.config.name, error = %e, "failed to start VM");
        return ExitCode::FAILURE;
    }
    info!(vm = %instance.config.name, pid = instance.pid, "VM started; Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to wait for Ctrl-C");
    }

    vm::stop(&driver, &mut instance, &net_setup, ShutoffReason::Shutdown).await;
    info!(vm = %instance.config.name, "VM stopped");
    ExitCode::SUCCESS
}
