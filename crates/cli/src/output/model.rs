use serde::{Deserialize, Serialize};
use tether_protocol::ErrorKind;

/// The result envelope returned by all commands.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult<T: Serialize> {
	pub ok: bool,
	pub command: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<T>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<CommandError>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub duration_ms: Option<u64>,
}

/// Error information for failed commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
	pub code: ErrorCode,
	pub message: String,
}

/// Standardized error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	DaemonNotRunning,
	AlreadyInProgress,
	NotFound,
	InvalidInput,
	PairingFailed,
	Disconnected,
	StorageError,
	TransportError,
	Timeout,
	InternalError,
}

impl From<ErrorKind> for ErrorCode {
	fn from(kind: ErrorKind) -> Self {
		match kind {
			ErrorKind::StorageError => ErrorCode::StorageError,
			ErrorKind::PairingFailure => ErrorCode::PairingFailed,
			ErrorKind::TransientDisconnect | ErrorKind::TerminalDisconnect => ErrorCode::Disconnected,
			ErrorKind::AlreadyInProgress => ErrorCode::AlreadyInProgress,
			ErrorKind::NotFound => ErrorCode::NotFound,
			ErrorKind::InvalidAccount => ErrorCode::InvalidInput,
			ErrorKind::Transport => ErrorCode::TransportError,
			ErrorKind::Timeout => ErrorCode::Timeout,
			ErrorKind::Internal => ErrorCode::InternalError,
		}
	}
}

impl std::fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ErrorCode::DaemonNotRunning => write!(f, "DAEMON_NOT_RUNNING"),
			ErrorCode::AlreadyInProgress => write!(f, "ALREADY_IN_PROGRESS"),
			ErrorCode::NotFound => write!(f, "NOT_FOUND"),
			ErrorCode::InvalidInput => write!(f, "INVALID_INPUT"),
			ErrorCode::PairingFailed => write!(f, "PAIRING_FAILED"),
			ErrorCode::Disconnected => write!(f, "DISCONNECTED"),
			ErrorCode::StorageError => write!(f, "STORAGE_ERROR"),
			ErrorCode::TransportError => write!(f, "TRANSPORT_ERROR"),
			ErrorCode::Timeout => write!(f, "TIMEOUT"),
			ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
		}
	}
}
