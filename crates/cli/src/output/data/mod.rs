use serde::{Deserialize, Serialize};
use tether_protocol::{AccountId, AccountStatus, ConnectionState, SessionEvent};

/// Result data for the connect command.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectData {
	pub account: AccountId,
	pub state: ConnectionState,
	/// Pairing code as shown to the operator (`ABCD-EFGH`).
	#[serde(skip_serializing_if = "Option::is_none")]
	pub pairing_code: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub events: Vec<SessionEvent>,
}

/// Result data for the list command.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListData {
	pub accounts: Vec<AccountId>,
	pub count: usize,
}

/// Result data for the remove command.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveData {
	pub account: AccountId,
	pub removed: bool,
}

/// Result data for the status command.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
	pub accounts: Vec<AccountStatus>,
}

/// Result data for ping and shutdown.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonData {
	pub running: bool,
	pub socket: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}
