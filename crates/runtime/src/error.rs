//! Error taxonomy for the session runtime.

use std::path::PathBuf;

use tether_protocol::{AccountId, ErrorKind, InvalidAccountId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Low-level cause of a storage failure.
#[derive(Debug, Error)]
pub enum StorageFault {
	#[error("{op} {path}: {source}")]
	Io {
		op: &'static str,
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("malformed {path}: {source}")]
	Json {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},
}

impl StorageFault {
	pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		StorageFault::Io {
			op,
			path: path.into(),
			source,
		}
	}
}

#[derive(Debug, Error)]
pub enum Error {
	#[error("storage failure{}: {source}", account_suffix(.account))]
	Storage {
		account: Option<AccountId>,
		#[source]
		source: StorageFault,
	},

	#[error("pairing failed for {account}: {reason}")]
	Pairing { account: AccountId, reason: String },

	#[error("connection dropped (code {}); reconnecting", code_text(.code))]
	TransientDisconnect { code: Option<u16> },

	#[error("connection closed permanently (code {}); account torn down", code_text(.code))]
	TerminalDisconnect { code: Option<u16> },

	#[error("account {0} already has a connection in progress; remove it first or wait")]
	AlreadyInProgress(AccountId),

	#[error("account {0} is not known")]
	NotFound(AccountId),

	#[error(transparent)]
	InvalidAccount(#[from] InvalidAccountId),

	#[error("transport error: {0}")]
	Transport(String),

	#[error("timed out: {0}")]
	Timeout(String),

	#[error("internal channel closed")]
	ChannelClosed,
}

impl Error {
	pub(crate) fn storage(account: Option<&AccountId>, source: StorageFault) -> Self {
		Error::Storage {
			account: account.cloned(),
			source,
		}
	}

	/// Category transported to control surfaces.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Error::Storage { .. } => ErrorKind::StorageError,
			Error::Pairing { .. } => ErrorKind::PairingFailure,
			Error::TransientDisconnect { .. } => ErrorKind::TransientDisconnect,
			Error::TerminalDisconnect { .. } => ErrorKind::TerminalDisconnect,
			Error::AlreadyInProgress(_) => ErrorKind::AlreadyInProgress,
			Error::NotFound(_) => ErrorKind::NotFound,
			Error::InvalidAccount(_) => ErrorKind::InvalidAccount,
			Error::Transport(_) => ErrorKind::Transport,
			Error::Timeout(_) => ErrorKind::Timeout,
			Error::ChannelClosed => ErrorKind::Internal,
		}
	}

	pub fn is_not_found(&self) -> bool {
		matches!(self, Error::NotFound(_))
	}
}

fn account_suffix(account: &Option<AccountId>) -> String {
	account.as_ref().map(|a| format!(" for {a}")).unwrap_or_default()
}

fn code_text(code: &Option<u16>) -> String {
	code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
}
