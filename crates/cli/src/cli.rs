use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tether_protocol::AccountId;

use crate::config::Overrides;
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Supervise many messaging-account sessions from one daemon")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug, -vvv trace)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Output format for command results
	#[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Json)]
	pub format: OutputFormat,

	/// Config file (defaults to <config dir>/tether/config.json)
	#[arg(long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Directory holding credentials and the session ledger
	#[arg(long, global = true, value_name = "DIR")]
	pub data_dir: Option<PathBuf>,

	/// Control socket of the daemon
	#[arg(long = "socket", global = true, value_name = "PATH")]
	pub socket_path: Option<PathBuf>,

	/// Gateway WebSocket URL (daemon only)
	#[arg(long = "gateway", global = true, value_name = "URL")]
	pub gateway_url: Option<String>,

	#[command(subcommand)]
	pub command: Commands,
}

impl Cli {
	pub fn overrides(&self) -> Overrides {
		Overrides {
			data_dir: self.data_dir.clone(),
			socket_path: self.socket_path.clone(),
			gateway_url: self.gateway_url.clone(),
		}
	}
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Run the daemon in the foreground and resume previously connected accounts
	Serve,

	/// Connect an account, pairing it first if it has no credentials
	Connect {
		#[arg(value_parser = parse_account)]
		account: AccountId,
	},

	/// List accounts with a live connection
	#[command(alias = "ls")]
	List,

	/// Disconnect an account and erase its credentials
	#[command(alias = "rm")]
	Remove {
		#[arg(value_parser = parse_account)]
		account: AccountId,
	},

	/// Show the state of one account, or of every known account
	Status {
		#[arg(value_parser = parse_account)]
		account: Option<AccountId>,
	},

	/// Check whether the daemon is running
	Ping,

	/// Stop the daemon, keeping every account resumable
	Shutdown,
}

fn parse_account(value: &str) -> Result<AccountId, String> {
	AccountId::new(value).map_err(|e| e.to_string())
}
