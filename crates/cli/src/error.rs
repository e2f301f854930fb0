use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
	#[error(transparent)]
	Runtime(#[from] tether_runtime::Error),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("config {path}: {message}")]
	Config { path: PathBuf, message: String },

	#[error("daemon: {0}")]
	Daemon(String),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}
