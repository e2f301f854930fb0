//! Newline-delimited JSON control protocol spoken over the daemon socket.

use serde::{Deserialize, Serialize};

use crate::account::AccountId;
use crate::event::{AccountStatus, ErrorKind, SessionEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
	Ping,
	/// Start a supervisor; the daemon answers with a stream of `Event` lines.
	Connect { account: AccountId },
	ListActive,
	Remove { account: AccountId },
	/// Status of one account, or of every known account when `account` is absent.
	Status {
		#[serde(default)]
		account: Option<AccountId>,
	},
	Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
	Pong,
	Ok,
	Event { event: SessionEvent },
	/// Terminates a `Connect` event stream.
	Done,
	Accounts { accounts: Vec<AccountId> },
	Status { accounts: Vec<AccountStatus> },
	Error { kind: ErrorKind, message: String },
}

impl ControlResponse {
	pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
		ControlResponse::Error {
			kind,
			message: message.into(),
		}
	}
}
