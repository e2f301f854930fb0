//! Connection lifecycle states and disconnect codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one account's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
	/// No supervisor is running for the account.
	#[default]
	Idle,
	Connecting,
	/// No local credentials; waiting for the operator to enter a pairing code.
	AwaitingPairingCode,
	Connected,
	/// Teardown in progress (credentials and ledger entry being released).
	Terminating,
}

impl ConnectionState {
	pub fn as_str(self) -> &'static str {
		match self {
			ConnectionState::Idle => "idle",
			ConnectionState::Connecting => "connecting",
			ConnectionState::AwaitingPairingCode => "awaiting_pairing_code",
			ConnectionState::Connected => "connected",
			ConnectionState::Terminating => "terminating",
		}
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Close status codes reported by the remote gateway.
///
/// Codes follow HTTP conventions: the `5xx` range is a server-side problem
/// and always retryable.
pub mod disconnect_code {
	pub const LOGGED_OUT: u16 = 401;
	pub const FORBIDDEN: u16 = 403;
	pub const CONNECTION_LOST: u16 = 408;
	pub const CONNECTION_CLOSED: u16 = 428;
	pub const CONNECTION_REPLACED: u16 = 440;
	pub const BAD_SESSION: u16 = 500;
	pub const UNAVAILABLE: u16 = 503;
	pub const RESTART_REQUIRED: u16 = 515;
}

/// Outcome of classifying a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectClass {
	/// Reconnect with the same credentials after the configured delay.
	Transient,
	/// Explicit logout or permanent rejection; tear everything down.
	Terminal,
	/// The account never connected; treat as a failed pairing and do not retry.
	PrePairingFailure,
}

impl fmt::Display for DisconnectClass {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			DisconnectClass::Transient => "transient",
			DisconnectClass::Terminal => "terminal",
			DisconnectClass::PrePairingFailure => "pre_pairing_failure",
		})
	}
}

/// Last observed disconnect of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectInfo {
	#[serde(default)]
	pub code: Option<u16>,
	pub class: DisconnectClass,
	#[serde(default)]
	pub reason: Option<String>,
	/// Unix timestamp (seconds).
	pub at: u64,
}
