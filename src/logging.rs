//! Logging initialization
//!
//! Console logging through tracing-subscriber with an environment filter.
//! The default keeps the crate at debug and everything else at info;
//! `RUST_LOG` overrides as usual.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{VmError, VmResult};

pub fn init() -> VmResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vmshepherd=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| VmError::Internal(format!("failed to initialize logging: {e}")))
}
