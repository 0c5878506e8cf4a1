//! Subscriber installation for embedders.
//!
//! Library crates only emit `tracing` events; whoever drives a build decides
//! where they go.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `kiln_build=debug`.
pub const ENV_LOG: &str = "KILN_LOG";

/// Installs a formatting subscriber filtered by `$KILN_LOG`.
///
/// Defaults to `warn` when the variable is unset or unparsable. Returns
/// `false` if a global subscriber was already installed.
pub fn init() -> bool {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .without_time()
        .with_target(true)
        .try_init()
        .is_ok()
}
