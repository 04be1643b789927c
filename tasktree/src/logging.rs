//! Diagnostics for the `tasktree` binary.
//!
//! Lock waits, git commands and dispatch steps are traced to stderr. Stdout
//! carries only the JSON result of a command, whatever the filter says.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Level used when `RUST_LOG` is unset or unparsable: rollbacks and
/// best-effort failures are logged at `warn`.
pub const DEFAULT_FILTER: &str = "warn";

/// Install the stderr subscriber once per process.
///
/// `RUST_LOG=tasktree::dispatch=debug,tasktree::io::vcs=trace` follows a
/// dispatch down to individual git calls. A second call is a no-op.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
