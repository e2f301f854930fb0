//! Seam between the supervisor and the remote gateway.
//!
//! The supervisor never touches a socket. It asks a [`Connector`] for a
//! [`Link`], reads [`LinkEvent`]s off the link, and drives the remote through
//! the link's [`SessionHandle`].

pub mod fake;
pub mod ws;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tether_protocol::AccountId;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::store::Credentials;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Capability over one live connection.
pub trait SessionHandle: Send + Sync {
	/// Sends an opaque payload over the connection.
	fn send(&self, payload: Value) -> BoxFuture<'_, Result<()>>;

	/// Asks the remote to issue a pairing code for this connection's account.
	fn request_pairing_code(&self) -> BoxFuture<'_, Result<String>>;

	/// Closes the connection. Idempotent.
	fn close(&self) -> BoxFuture<'_, ()>;

	fn is_closed(&self) -> bool;
}

/// Connection-level notifications, in the order the remote produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
	/// Handshake finished; the account is usable.
	Open,
	/// The remote accepted a pairing code entered by the operator.
	Paired,
	/// The remote issued new credential state that must be persisted.
	CredentialsUpdated(Credentials),
	/// The connection ended. A dropped event channel means `Closed { code: None }`.
	Closed { code: Option<u16>, reason: Option<String> },
}

/// An opened (not necessarily authenticated) connection.
pub struct Link {
	pub handle: Arc<dyn SessionHandle>,
	pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl std::fmt::Debug for Link {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Link").field("closed", &self.handle.is_closed()).finish_non_exhaustive()
	}
}

/// Opens connections to the remote gateway.
pub trait Connector: Send + Sync {
	/// Opens a connection for `account`, presenting `credentials` when the
	/// account has already paired.
	fn open<'a>(&'a self, account: &'a AccountId, credentials: Option<Credentials>) -> BoxFuture<'a, Result<Link>>;
}
