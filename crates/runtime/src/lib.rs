//! Supervision of many independent messaging-account sessions in one process.
//!
//! [`SessionManager`] is the entry point. Each connected account gets its own
//! supervisor task that drives the connection through pairing, persists
//! credentials in the [`CredentialStore`], records the account in the
//! [`Ledger`] once it has connected, and publishes live handles through the
//! [`SessionRegistry`]. Transports plug in through [`Connector`].

pub mod error;
mod fsutil;
pub mod ledger;
pub mod manager;
pub mod pairing;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod transport;

use std::time::{SystemTime, UNIX_EPOCH};

pub use error::{Error, Result, StorageFault};
pub use ledger::Ledger;
pub use manager::{SessionManager, StatusStream};
pub use pairing::{PairingConfig, PairingCoordinator};
pub use registry::SessionRegistry;
pub use store::{CredentialStore, Credentials};
pub use supervisor::{SupervisorConfig, classify};
pub use transport::ws::WsConnector;
pub use transport::{BoxFuture, Connector, Link, LinkEvent, SessionHandle};

pub(crate) fn now_ts() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}
