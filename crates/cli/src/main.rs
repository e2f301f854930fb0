use clap::Parser;
use tether_cli::cli::Cli;
use tether_cli::config::Config;
use tether_cli::output::{CommandError, ErrorCode, print_error_stderr};
use tether_cli::{commands, logging};
use tracing::error;

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let settings = match Config::load(cli.config.as_deref()) {
		Ok(config) => config.resolve(cli.overrides()),
		Err(err) => {
			error!(target = "tether", error = %err, "invalid configuration");
			std::process::exit(2);
		}
	};

	match commands::dispatch(cli.command, settings, cli.format).await {
		Ok(true) => {}
		Ok(false) => std::process::exit(1),
		Err(err) => {
			print_error_stderr(&CommandError {
				code: ErrorCode::InternalError,
				message: err.to_string(),
			});
			std::process::exit(1);
		}
	}
}
