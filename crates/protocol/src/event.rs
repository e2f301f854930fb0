//! Status events and account snapshots surfaced to control surfaces.

use serde::{Deserialize, Serialize};

use crate::account::AccountId;
use crate::state::{ConnectionState, DisconnectInfo};

/// Machine-readable error category shared by every control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	StorageError,
	PairingFailure,
	TransientDisconnect,
	TerminalDisconnect,
	AlreadyInProgress,
	NotFound,
	InvalidAccount,
	Transport,
	Timeout,
	Internal,
}

impl ErrorKind {
	pub fn as_str(self) -> &'static str {
		match self {
			ErrorKind::StorageError => "storage_error",
			ErrorKind::PairingFailure => "pairing_failure",
			ErrorKind::TransientDisconnect => "transient_disconnect",
			ErrorKind::TerminalDisconnect => "terminal_disconnect",
			ErrorKind::AlreadyInProgress => "already_in_progress",
			ErrorKind::NotFound => "not_found",
			ErrorKind::InvalidAccount => "invalid_account",
			ErrorKind::Transport => "transport",
			ErrorKind::Timeout => "timeout",
			ErrorKind::Internal => "internal",
		}
	}
}

impl std::fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Event emitted by a supervisor while it drives one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
	/// The account moved to a new lifecycle state.
	State { account: AccountId, state: ConnectionState },
	/// The remote issued a pairing code the operator must enter on the device.
	PairingCode { account: AccountId, code: String },
	/// A transient drop was observed; the next attempt starts after `delay_ms`.
	Reconnecting {
		account: AccountId,
		#[serde(default)]
		code: Option<u16>,
		delay_ms: u64,
	},
	/// The account was torn down after a terminal disconnect.
	Terminated {
		account: AccountId,
		#[serde(default)]
		code: Option<u16>,
	},
	/// The connect attempt failed; the account is back to idle.
	Failed { account: AccountId, kind: ErrorKind, message: String },
}

impl SessionEvent {
	pub fn account(&self) -> &AccountId {
		match self {
			SessionEvent::State { account, .. }
			| SessionEvent::PairingCode { account, .. }
			| SessionEvent::Reconnecting { account, .. }
			| SessionEvent::Terminated { account, .. }
			| SessionEvent::Failed { account, .. } => account,
		}
	}

	/// Returns the new state when this is a state-transition event.
	pub fn state(&self) -> Option<ConnectionState> {
		match self {
			SessionEvent::State { state, .. } => Some(*state),
			_ => None,
		}
	}
}

/// Point-in-time view of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
	pub account: AccountId,
	pub state: ConnectionState,
	pub ever_connected: bool,
	#[serde(default)]
	pub last_disconnect: Option<DisconnectInfo>,
	pub in_ledger: bool,
	pub has_credentials: bool,
	/// Most recent pairing attempt, while one is relevant.
	#[serde(default)]
	pub pairing: Option<PairingAttempt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PairingOutcome {
	Pending,
	Issued,
	Failed { reason: String },
}

/// One request for a pairing code. Discarded once the account connects or is torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingAttempt {
	pub account: AccountId,
	/// Unix timestamp (seconds).
	pub requested_at: u64,
	#[serde(default)]
	pub code: Option<String>,
	pub outcome: PairingOutcome,
}

impl PairingAttempt {
	pub fn new(account: AccountId, requested_at: u64) -> Self {
		Self {
			account,
			requested_at,
			code: None,
			outcome: PairingOutcome::Pending,
		}
	}

	pub fn issue(&mut self, code: impl Into<String>) {
		self.code = Some(code.into());
		self.outcome = PairingOutcome::Issued;
	}

	pub fn fail(&mut self, reason: impl Into<String>) {
		self.outcome = PairingOutcome::Failed { reason: reason.into() };
	}
}

/// Groups a raw pairing code into blocks of four for display (`ABCD-EFGH`).
pub fn format_pairing_code(code: &str) -> String {
	let chars: Vec<char> = code.chars().collect();
	chars.chunks(4).map(|chunk| chunk.iter().collect::<String>()).collect::<Vec<_>>().join("-")
}
