use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the stderr subscriber.
///
/// - 0: `RUST_LOG`, or warnings only
/// - 1 (`-v`): info
/// - 2 (`-vv`): debug
/// - 3+ (`-vvv`): trace
pub fn init_logging(verbose: u8) {
	let filter = match verbose {
		0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
		1 => EnvFilter::new("info"),
		2 => EnvFilter::new("debug"),
		_ => EnvFilter::new("trace"),
	};

	// A second init (tests, embedding) keeps the first subscriber.
	let _ = tracing_subscriber::registry()
		.with(fmt::layer().with_writer(std::io::stderr).with_target(true))
		.with(filter)
		.try_init();
}
