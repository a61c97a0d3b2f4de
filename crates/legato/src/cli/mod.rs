pub mod simulate;
pub mod transform;

use tracing_subscriber::EnvFilter;

/// Log to stderr, honouring `RUST_LOG` and defaulting to warnings only.
pub(crate) fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // A subscriber may already be installed when running under a test harness
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
