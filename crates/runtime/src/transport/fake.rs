//! In-memory connector for exercising supervisors without a network.
//!
//! Every call to [`Connector::open`] consumes the next [`Script`] queued for
//! the account (or the default script) and records the attempt, including the
//! credentials that were presented.
//!
//! # Example
//!
//! ```ignore
//! let (connector, controller) = FakeConnectorBuilder::new().build();
//! controller.script(&account, [Script::Open, Script::Close(Some(503)), Script::Open]);
//!
//! let manager = SessionManager::new(Arc::new(connector), dir.path(), config);
//! let mut stream = manager.connect(account.clone())?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tether_protocol::AccountId;
use tokio::sync::mpsc;

use super::{BoxFuture, Connector, Link, LinkEvent, SessionHandle};
use crate::error::{Error, Result};
use crate::store::Credentials;

/// What one connection attempt does.
#[derive(Debug, Clone, PartialEq)]
pub enum Script {
	/// Connection opens immediately.
	Open,
	/// Connection closes immediately with the given code.
	Close(Option<u16>),
	/// `open` itself fails.
	FailOpen(String),
	/// Nothing happens until the test injects events.
	Manual,
}

/// How handles answer `request_pairing_code`.
#[derive(Debug, Clone, PartialEq)]
pub enum Pairing {
	/// Issue the code and leave the rest to the test.
	Issue(String),
	/// Issue the code, then report `Paired`, the credentials, and `Open`.
	IssueAndAccept { code: String, credentials: Credentials },
	Reject(String),
	/// Never answer.
	Hang,
}

/// Snapshot of one recorded `open` call.
#[derive(Debug, Clone)]
pub struct Attempt {
	pub account: AccountId,
	pub credentials: Option<Credentials>,
	pub opened: bool,
}

struct AttemptSlot {
	info: Attempt,
	handle: Option<Arc<FakeHandle>>,
	events: Option<mpsc::UnboundedSender<LinkEvent>>,
}

struct FakeState {
	scripts: HashMap<AccountId, VecDeque<Script>>,
	default_script: Script,
	pairing: Pairing,
	attempts: Vec<AttemptSlot>,
}

pub struct FakeConnectorBuilder {
	default_script: Script,
	pairing: Pairing,
}

impl FakeConnectorBuilder {
	pub fn new() -> Self {
		Self {
			default_script: Script::Manual,
			pairing: Pairing::Issue("ABCDEFGH".to_string()),
		}
	}

	/// Script used when an account has nothing queued.
	pub fn default_script(mut self, script: Script) -> Self {
		self.default_script = script;
		self
	}

	pub fn pairing(mut self, pairing: Pairing) -> Self {
		self.pairing = pairing;
		self
	}

	pub fn build(self) -> (FakeConnector, FakeController) {
		let state = Arc::new(Mutex::new(FakeState {
			scripts: HashMap::new(),
			default_script: self.default_script,
			pairing: self.pairing,
			attempts: Vec::new(),
		}));
		(
			FakeConnector { state: Arc::clone(&state) },
			FakeController { state },
		)
	}
}

impl Default for FakeConnectorBuilder {
	fn default() -> Self {
		Self::new()
	}
}

pub struct FakeConnector {
	state: Arc<Mutex<FakeState>>,
}

impl Connector for FakeConnector {
	fn open<'a>(&'a self, account: &'a AccountId, credentials: Option<Credentials>) -> BoxFuture<'a, Result<Link>> {
		Box::pin(async move {
			let mut state = self.state.lock();
			let queued = state.scripts.get_mut(account).and_then(VecDeque::pop_front);
			let script = match queued {
				Some(script) => script,
				None => state.default_script.clone(),
			};

			let mut info = Attempt {
				account: account.clone(),
				credentials,
				opened: false,
			};

			if let Script::FailOpen(reason) = script {
				state.attempts.push(AttemptSlot {
					info,
					handle: None,
					events: None,
				});
				return Err(Error::Transport(reason));
			}

			let (tx, rx) = mpsc::unbounded_channel();
			let handle = Arc::new(FakeHandle::new(state.pairing.clone(), Some(tx.clone())));
			match script {
				Script::Open => {
					let _ = tx.send(LinkEvent::Open);
				}
				Script::Close(code) => {
					let _ = tx.send(LinkEvent::Closed { code, reason: None });
				}
				Script::Manual | Script::FailOpen(_) => {}
			}
			info.opened = true;
			state.attempts.push(AttemptSlot {
				info,
				handle: Some(Arc::clone(&handle)),
				events: Some(tx),
			});

			Ok(Link { handle, events: rx })
		})
	}
}

/// Test-side control over a [`FakeConnector`].
#[derive(Clone)]
pub struct FakeController {
	state: Arc<Mutex<FakeState>>,
}

impl FakeController {
	/// Queues scripts for the next attempts of `account`.
	pub fn script(&self, account: &AccountId, scripts: impl IntoIterator<Item = Script>) {
		self.state.lock().scripts.entry(account.clone()).or_default().extend(scripts);
	}

	pub fn set_pairing(&self, pairing: Pairing) {
		self.state.lock().pairing = pairing;
	}

	pub fn attempts(&self, account: &AccountId) -> Vec<Attempt> {
		self.state
			.lock()
			.attempts
			.iter()
			.filter(|slot| &slot.info.account == account)
			.map(|slot| slot.info.clone())
			.collect()
	}

	pub fn attempt_count(&self, account: &AccountId) -> usize {
		self.state.lock().attempts.iter().filter(|slot| &slot.info.account == account).count()
	}

	/// Handle of the most recent successful attempt for `account`.
	pub fn latest_handle(&self, account: &AccountId) -> Option<Arc<FakeHandle>> {
		self.state
			.lock()
			.attempts
			.iter()
			.rev()
			.filter(|slot| &slot.info.account == account)
			.find_map(|slot| slot.handle.clone())
	}

	/// Delivers `event` on the most recent connection of `account`.
	/// Returns `false` when there is no such connection.
	pub fn inject(&self, account: &AccountId, event: LinkEvent) -> bool {
		self.state
			.lock()
			.attempts
			.iter()
			.rev()
			.filter(|slot| &slot.info.account == account)
			.find_map(|slot| slot.events.as_ref())
			.is_some_and(|tx| tx.send(event).is_ok())
	}

	/// Polls until `account` has seen at least `count` attempts.
	pub async fn wait_for_attempts(&self, account: &AccountId, count: usize, within: Duration) -> bool {
		let deadline = tokio::time::Instant::now() + within;
		while tokio::time::Instant::now() < deadline {
			if self.attempt_count(account) >= count {
				return true;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		self.attempt_count(account) >= count
	}
}

/// Handle returned by [`FakeConnector`]. Records sent payloads.
pub struct FakeHandle {
	pairing: Pairing,
	events: Option<mpsc::UnboundedSender<LinkEvent>>,
	sent: Mutex<Vec<Value>>,
	pairing_requests: Mutex<usize>,
	closed: AtomicBool,
}

impl FakeHandle {
	fn new(pairing: Pairing, events: Option<mpsc::UnboundedSender<LinkEvent>>) -> Self {
		Self {
			pairing,
			events,
			sent: Mutex::new(Vec::new()),
			pairing_requests: Mutex::new(0),
			closed: AtomicBool::new(false),
		}
	}

	pub fn sent(&self) -> Vec<Value> {
		self.sent.lock().clone()
	}

	pub fn pairing_requests(&self) -> usize {
		*self.pairing_requests.lock()
	}
}

impl SessionHandle for FakeHandle {
	fn send(&self, payload: Value) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			if self.is_closed() {
				return Err(Error::Transport("connection closed".to_string()));
			}
			self.sent.lock().push(payload);
			Ok(())
		})
	}

	fn request_pairing_code(&self) -> BoxFuture<'_, Result<String>> {
		Box::pin(async move {
			*self.pairing_requests.lock() += 1;
			match &self.pairing {
				Pairing::Issue(code) => Ok(code.clone()),
				Pairing::IssueAndAccept { code, credentials } => {
					if let Some(tx) = &self.events {
						let _ = tx.send(LinkEvent::Paired);
						let _ = tx.send(LinkEvent::CredentialsUpdated(credentials.clone()));
						let _ = tx.send(LinkEvent::Open);
					}
					Ok(code.clone())
				}
				Pairing::Reject(reason) => Err(Error::Transport(reason.clone())),
				Pairing::Hang => std::future::pending().await,
			}
		})
	}

	fn close(&self) -> BoxFuture<'_, ()> {
		Box::pin(async move {
			self.closed.store(true, Ordering::SeqCst);
		})
	}

	fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}
}

/// Handle with no remote behind it.
pub struct NullHandle(FakeHandle);

impl Default for NullHandle {
	fn default() -> Self {
		Self(FakeHandle::new(Pairing::Reject("no remote".to_string()), None))
	}
}

impl SessionHandle for NullHandle {
	fn send(&self, payload: Value) -> BoxFuture<'_, Result<()>> {
		self.0.send(payload)
	}

	fn request_pairing_code(&self) -> BoxFuture<'_, Result<String>> {
		self.0.request_pairing_code()
	}

	fn close(&self) -> BoxFuture<'_, ()> {
		self.0.close()
	}

	fn is_closed(&self) -> bool {
		self.0.is_closed()
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn id(s: &str) -> AccountId {
		AccountId::new(s).unwrap()
	}

	#[tokio::test]
	async fn scripts_are_consumed_in_order_then_default() {
		let (connector, controller) = FakeConnectorBuilder::new().default_script(Script::Open).build();
		let account = id("1");
		controller.script(&account, [Script::Close(Some(503)), Script::FailOpen("refused".into())]);

		let mut link = connector.open(&account, None).await.unwrap();
		assert_eq!(link.events.recv().await, Some(LinkEvent::Closed { code: Some(503), reason: None }));

		assert!(connector.open(&account, None).await.is_err());

		let mut link = connector.open(&account, None).await.unwrap();
		assert_eq!(link.events.recv().await, Some(LinkEvent::Open));

		let attempts = controller.attempts(&account);
		assert_eq!(attempts.len(), 3);
		assert!(!attempts[1].opened);
	}

	#[tokio::test]
	async fn inject_reaches_latest_connection() {
		let (connector, controller) = FakeConnectorBuilder::new().build();
		let account = id("1");
		let creds = Credentials::new(json!({ "k": 1 }));
		let mut link = connector.open(&account, Some(creds.clone())).await.unwrap();

		assert!(controller.inject(&account, LinkEvent::Paired));
		assert_eq!(link.events.recv().await, Some(LinkEvent::Paired));
		assert_eq!(controller.attempts(&account)[0].credentials, Some(creds));
		assert!(!controller.inject(&id("2"), LinkEvent::Open));
	}

	#[tokio::test]
	async fn handle_records_sends_and_refuses_after_close() {
		let (connector, controller) = FakeConnectorBuilder::new().build();
		let account = id("1");
		let link = connector.open(&account, None).await.unwrap();

		link.handle.send(json!({ "text": "hello" })).await.unwrap();
		link.handle.close().await;
		assert!(link.handle.send(json!({})).await.is_err());

		let handle = controller.latest_handle(&account).unwrap();
		assert_eq!(handle.sent(), vec![json!({ "text": "hello" })]);
		assert!(handle.is_closed());
	}
}
