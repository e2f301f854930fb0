//! Layered configuration: built-in defaults, then an optional JSON file, then flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_runtime::{PairingConfig, SupervisorConfig};
use tracing::debug;

use crate::error::{CliError, Result};

pub const APP_DIR: &str = "tether";
pub const CONFIG_FILE: &str = "config.json";
pub const SOCKET_FILE: &str = "tether.sock";
pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:7300/link";

/// On-disk configuration. Every field may be omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	pub data_dir: Option<PathBuf>,
	pub socket_path: Option<PathBuf>,
	pub gateway_url: String,
	pub reconnect_delay_ms: u64,
	pub pairing_delay_ms: u64,
	pub pairing_timeout_ms: u64,
	pub pairing_window_ms: u64,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			data_dir: None,
			socket_path: None,
			gateway_url: DEFAULT_GATEWAY_URL.to_string(),
			reconnect_delay_ms: 2_000,
			pairing_delay_ms: 1_000,
			pairing_timeout_ms: 30_000,
			pairing_window_ms: 180_000,
		}
	}
}

/// Values given on the command line; they win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
	pub data_dir: Option<PathBuf>,
	pub socket_path: Option<PathBuf>,
	pub gateway_url: Option<String>,
}

/// Fully resolved settings used by the daemon and the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
	pub data_dir: PathBuf,
	pub socket_path: PathBuf,
	pub gateway_url: String,
	pub supervisor: SupervisorConfig,
}

pub fn default_config_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

pub fn default_data_dir() -> PathBuf {
	dirs::data_dir()
		.map(|dir| dir.join(APP_DIR))
		.unwrap_or_else(|| PathBuf::from(".tether"))
}

impl Config {
	/// Loads `explicit` (which must exist) or the default location (which may not).
	pub fn load(explicit: Option<&Path>) -> Result<Self> {
		match explicit {
			Some(path) => Self::read(path),
			None => match default_config_path() {
				Some(path) if path.is_file() => Self::read(&path),
				_ => Ok(Self::default()),
			},
		}
	}

	fn read(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path).map_err(|e| CliError::Config {
			path: path.to_path_buf(),
			message: e.to_string(),
		})?;
		let config = serde_json::from_str(&text).map_err(|e| CliError::Config {
			path: path.to_path_buf(),
			message: e.to_string(),
		})?;
		debug!(target = "tether.config", path = %path.display(), "loaded config file");
		Ok(config)
	}

	pub fn resolve(self, overrides: Overrides) -> Settings {
		let data_dir = overrides.data_dir.or(self.data_dir).unwrap_or_else(default_data_dir);
		let socket_path = overrides
			.socket_path
			.or(self.socket_path)
			.unwrap_or_else(|| data_dir.join(SOCKET_FILE));

		Settings {
			socket_path,
			gateway_url: overrides.gateway_url.unwrap_or(self.gateway_url),
			supervisor: SupervisorConfig {
				reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
				pairing: PairingConfig {
					settle_delay: Duration::from_millis(self.pairing_delay_ms),
					request_timeout: Duration::from_millis(self.pairing_timeout_ms),
					window: Duration::from_millis(self.pairing_window_ms),
				},
			},
			data_dir,
		}
	}
}
