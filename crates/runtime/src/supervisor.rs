//! Per-account connection supervisor.
//!
//! One supervisor task owns one account from the connect request until the
//! account is torn down, the attempt is aborted, or the task is cancelled.
//! Retries are iterations of an explicit loop; the only places the task
//! suspends are the connector, the pairing request, the event channel and the
//! reconnect timer, and each of them also observes the cancel signal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_protocol::{
	AccountId, ConnectionState, DisconnectClass, DisconnectInfo, ErrorKind, PairingAttempt, SessionEvent, disconnect_code,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::ledger::Ledger;
use crate::now_ts;
use crate::pairing::{PairingConfig, PairingCoordinator};
use crate::registry::SessionRegistry;
use crate::store::{CredentialStore, Credentials};
use crate::transport::{Connector, Link, LinkEvent, SessionHandle};

/// Maps a close code to the action the supervisor takes.
///
/// Server errors are always retried, an explicit logout always tears down,
/// and anything else depends on whether the account ever connected: before
/// that it is a failed pairing (no retry), after it a transient drop.
pub fn classify(code: Option<u16>, ever_connected: bool) -> DisconnectClass {
	match code {
		Some(500..=599) => DisconnectClass::Transient,
		Some(disconnect_code::LOGGED_OUT) => DisconnectClass::Terminal,
		_ if ever_connected => DisconnectClass::Transient,
		_ => DisconnectClass::PrePairingFailure,
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
	/// Fixed delay before every reconnect attempt.
	pub reconnect_delay: Duration,
	pub pairing: PairingConfig,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			reconnect_delay: Duration::from_secs(2),
			pairing: PairingConfig::default(),
		}
	}
}

/// Collaborators shared by every supervisor of one manager.
pub(crate) struct Services {
	pub(crate) connector: Arc<dyn Connector>,
	pub(crate) store: Arc<CredentialStore>,
	pub(crate) ledger: Arc<Ledger>,
	pub(crate) registry: Arc<SessionRegistry>,
	pub(crate) pairing: PairingCoordinator,
	pub(crate) config: SupervisorConfig,
}

/// Mutable view of one account, read by status queries.
#[derive(Debug, Clone, Default)]
pub(crate) struct AccountRecord {
	pub(crate) state: ConnectionState,
	pub(crate) ever_connected: bool,
	pub(crate) last_disconnect: Option<DisconnectInfo>,
	pub(crate) pairing: Option<PairingAttempt>,
}

/// Why a supervisor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
	/// Removal or shutdown; storage untouched.
	Cancelled,
	/// Credentials erased and ledger entry dropped; the account no longer exists.
	TornDown,
	/// The attempt failed without teardown (storage error); the account is idle.
	Aborted,
}

enum Flow {
	Retry,
	Exit(Exit),
}

pub(crate) struct Supervisor {
	account: AccountId,
	services: Arc<Services>,
	record: Arc<Mutex<AccountRecord>>,
	events: mpsc::UnboundedSender<SessionEvent>,
	cancel: watch::Receiver<bool>,
}

impl Supervisor {
	pub(crate) fn new(
		account: AccountId,
		services: Arc<Services>,
		record: Arc<Mutex<AccountRecord>>,
		events: mpsc::UnboundedSender<SessionEvent>,
		cancel: watch::Receiver<bool>,
	) -> Self {
		Self {
			account,
			services,
			record,
			events,
			cancel,
		}
	}

	pub(crate) async fn run(mut self) -> Exit {
		let mut attempt: u64 = 0;
		loop {
			attempt += 1;
			self.transition(ConnectionState::Connecting);

			let credentials = match self.services.store.load(&self.account) {
				Ok(credentials) => credentials,
				Err(err) => return self.abort(err),
			};
			debug!(
				target = "tether.supervisor",
				account = %self.account,
				attempt,
				has_credentials = credentials.is_some(),
				"opening connection"
			);

			let needs_pairing = credentials.is_none();
			let services = Arc::clone(&self.services);
			let opened = until_cancelled(&mut self.cancel, services.connector.open(&self.account, credentials)).await;

			let flow = match opened {
				None => return Exit::Cancelled,
				Some(Ok(link)) => self.drive_link(link, needs_pairing).await,
				Some(Err(err)) => {
					warn!(target = "tether.supervisor", account = %self.account, error = %err, "open failed");
					self.on_disconnect(None, Some(err.to_string())).await
				}
			};

			match flow {
				Flow::Retry => continue,
				Flow::Exit(exit) => return exit,
			}
		}
	}

	async fn drive_link(&mut self, link: Link, needs_pairing: bool) -> Flow {
		let Link { handle, mut events } = link;
		let mut registered = false;
		let mut pairing_deadline = None;

		if needs_pairing {
			self.transition(ConnectionState::AwaitingPairingCode);
			let mut attempt = PairingAttempt::new(self.account.clone(), now_ts());
			self.record.lock().pairing = Some(attempt.clone());

			let services = Arc::clone(&self.services);
			let requested = until_cancelled(&mut self.cancel, services.pairing.request(&mut attempt, handle.as_ref())).await;
			self.record.lock().pairing = Some(attempt);

			match requested {
				None => {
					handle.close().await;
					return Flow::Exit(Exit::Cancelled);
				}
				Some(Ok(code)) => {
					self.emit(SessionEvent::PairingCode {
						account: self.account.clone(),
						code,
					});
					pairing_deadline = Some(Instant::now() + self.services.config.pairing.window);
				}
				Some(Err(err)) => {
					handle.close().await;
					return self.pairing_failed(err).await;
				}
			}
		}

		loop {
			let deadline = pairing_deadline;
			let next = async {
				match deadline {
					Some(deadline) => tokio::time::timeout_at(deadline, events.recv()).await.ok(),
					None => Some(events.recv().await),
				}
			};

			let event = match until_cancelled(&mut self.cancel, next).await {
				None => {
					self.release(&handle, registered).await;
					return Flow::Exit(Exit::Cancelled);
				}
				Some(None) => {
					handle.close().await;
					let window = self.services.config.pairing.window;
					let err = Error::Pairing {
						account: self.account.clone(),
						reason: format!("pairing code not used within {}s", window.as_secs()),
					};
					if let Some(attempt) = self.record.lock().pairing.as_mut() {
						attempt.fail(err.to_string());
					}
					return self.pairing_failed(err).await;
				}
				Some(Some(None)) => LinkEvent::Closed {
					code: None,
					reason: Some("event stream ended".to_string()),
				},
				Some(Some(Some(event))) => event,
			};

			match event {
				LinkEvent::Open => {
					pairing_deadline = None;
					if let Err(err) = self.services.ledger.insert(&self.account) {
						handle.close().await;
						return Flow::Exit(self.abort(err));
					}
					if let Some(previous) = self.services.registry.register(self.account.clone(), Arc::clone(&handle)) {
						if !Arc::ptr_eq(&previous, &handle) {
							previous.close().await;
						}
					}
					registered = true;
					{
						let mut record = self.record.lock();
						record.ever_connected = true;
						record.pairing = None;
					}
					self.transition(ConnectionState::Connected);
				}
				LinkEvent::Paired => {
					info!(target = "tether.supervisor", account = %self.account, "pairing accepted");
					self.transition(ConnectionState::Connecting);
				}
				LinkEvent::CredentialsUpdated(credentials) => {
					if let Err(err) = self.persist(&credentials) {
						self.release(&handle, registered).await;
						return Flow::Exit(self.abort(err));
					}
				}
				LinkEvent::Closed { code, reason } => {
					if registered {
						self.services.registry.unregister_if(&self.account, &handle);
					}
					handle.close().await;
					return self.on_disconnect(code, reason).await;
				}
			}
		}
	}

	async fn on_disconnect(&mut self, code: Option<u16>, reason: Option<String>) -> Flow {
		let ever_connected = self.record.lock().ever_connected;
		let class = classify(code, ever_connected);
		self.record.lock().last_disconnect = Some(DisconnectInfo {
			code,
			class,
			reason: reason.clone(),
			at: now_ts(),
		});

		match class {
			DisconnectClass::Transient => {
				let delay = self.services.config.reconnect_delay;
				let err = Error::TransientDisconnect { code };
				warn!(
					target = "tether.supervisor",
					account = %self.account,
					error = %err,
					reason = reason.as_deref().unwrap_or(""),
					delay_ms = delay.as_millis() as u64,
					"disconnect"
				);
				self.emit(SessionEvent::Reconnecting {
					account: self.account.clone(),
					code,
					delay_ms: delay.as_millis() as u64,
				});
				match until_cancelled(&mut self.cancel, tokio::time::sleep(delay)).await {
					Some(()) => Flow::Retry,
					None => Flow::Exit(Exit::Cancelled),
				}
			}
			DisconnectClass::Terminal => {
				let err = Error::TerminalDisconnect { code };
				info!(target = "tether.supervisor", account = %self.account, error = %err, "disconnect");
				self.teardown().await;
				self.emit(SessionEvent::Terminated {
					account: self.account.clone(),
					code,
				});
				self.transition(ConnectionState::Idle);
				Flow::Exit(Exit::TornDown)
			}
			DisconnectClass::PrePairingFailure => {
				let message = match &reason {
					Some(reason) => format!("connection closed before the account was paired (code {code:?}): {reason}"),
					None => format!("connection closed before the account was paired (code {code:?})"),
				};
				info!(target = "tether.supervisor", account = %self.account, code = ?code, "pairing failed; not retrying");
				self.teardown().await;
				self.emit(SessionEvent::Failed {
					account: self.account.clone(),
					kind: ErrorKind::PairingFailure,
					message,
				});
				self.transition(ConnectionState::Idle);
				Flow::Exit(Exit::TornDown)
			}
		}
	}

	async fn pairing_failed(&mut self, err: Error) -> Flow {
		self.record.lock().last_disconnect = Some(DisconnectInfo {
			code: None,
			class: DisconnectClass::PrePairingFailure,
			reason: Some(err.to_string()),
			at: now_ts(),
		});
		self.teardown().await;
		self.emit(SessionEvent::Failed {
			account: self.account.clone(),
			kind: err.kind(),
			message: err.to_string(),
		});
		self.transition(ConnectionState::Idle);
		Flow::Exit(Exit::TornDown)
	}

	/// Releases everything the account holds: live handle, credentials, ledger entry.
	async fn teardown(&mut self) {
		self.transition(ConnectionState::Terminating);

		if let Some(handle) = self.services.registry.unregister(&self.account) {
			handle.close().await;
		}
		if let Err(err) = self.services.store.erase(&self.account) {
			error!(target = "tether.supervisor", account = %self.account, error = %err, "failed to erase credentials");
		}
		if let Err(err) = self.services.ledger.remove(&self.account) {
			error!(target = "tether.supervisor", account = %self.account, error = %err, "failed to update ledger");
		}
		self.record.lock().pairing = None;
	}

	/// Reports a storage failure and stops without touching persisted state.
	fn abort(&mut self, err: Error) -> Exit {
		error!(target = "tether.supervisor", account = %self.account, error = %err, "connect attempt aborted");
		self.emit(SessionEvent::Failed {
			account: self.account.clone(),
			kind: err.kind(),
			message: err.to_string(),
		});
		self.transition(ConnectionState::Idle);
		Exit::Aborted
	}

	async fn release(&self, handle: &Arc<dyn SessionHandle>, registered: bool) {
		if registered {
			self.services.registry.unregister_if(&self.account, handle);
		}
		handle.close().await;
	}

	fn persist(&self, credentials: &Credentials) -> crate::Result<()> {
		self.services.store.save(&self.account, credentials)
	}

	fn transition(&self, state: ConnectionState) {
		let previous = std::mem::replace(&mut self.record.lock().state, state);
		if previous == state {
			return;
		}
		info!(target = "tether.supervisor", account = %self.account, from = %previous, to = %state, "state change");
		self.emit(SessionEvent::State {
			account: self.account.clone(),
			state,
		});
	}

	fn emit(&self, event: SessionEvent) {
		// The status stream may have been dropped; the supervisor keeps going.
		let _ = self.events.send(event);
	}
}

/// Runs `fut` unless the cancel flag is raised first. A dropped cancel sender
/// counts as cancellation.
async fn until_cancelled<F: Future>(cancel: &mut watch::Receiver<bool>, fut: F) -> Option<F::Output> {
	tokio::select! {
		biased;
		_ = cancelled(cancel) => None,
		out = fut => Some(out),
	}
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
	loop {
		if *cancel.borrow_and_update() {
			return;
		}
		if cancel.changed().await.is_err() {
			return;
		}
	}
}
