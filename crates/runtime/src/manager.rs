//! Control operations over all supervised accounts.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use parking_lot::Mutex;
use tether_protocol::{AccountId, AccountStatus, ConnectionState, SessionEvent};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::pairing::PairingCoordinator;
use crate::registry::SessionRegistry;
use crate::store::CredentialStore;
use crate::supervisor::{AccountRecord, Exit, Services, Supervisor, SupervisorConfig};
use crate::transport::{Connector, SessionHandle};

/// Directory under the data dir holding one credential directory per account.
pub const AUTH_DIR: &str = "auth";
/// Ledger file name under the data dir.
pub const LEDGER_FILE: &str = "sessions.json";

struct Running {
	generation: u64,
	cancel: watch::Sender<bool>,
	task: JoinHandle<()>,
}

struct AccountEntry {
	record: Arc<Mutex<AccountRecord>>,
	running: Option<Running>,
	removing: bool,
}

impl AccountEntry {
	fn new() -> Self {
		Self {
			record: Arc::new(Mutex::new(AccountRecord::default())),
			running: None,
			removing: false,
		}
	}

	fn is_busy(&self) -> bool {
		self.running.is_some() || self.removing
	}
}

#[derive(Default)]
struct Slots {
	next_generation: u64,
	accounts: HashMap<AccountId, AccountEntry>,
}

/// Owns every account supervisor of one process.
///
/// At most one supervisor runs per account: [`connect`](Self::connect) checks
/// and claims the account's slot under a single lock acquisition.
pub struct SessionManager {
	services: Arc<Services>,
	slots: Arc<Mutex<Slots>>,
}

impl SessionManager {
	/// Creates a manager persisting under `data_dir` (`auth/` and `sessions.json`).
	pub fn new(connector: Arc<dyn Connector>, data_dir: &Path, config: SupervisorConfig) -> Self {
		Self::with_parts(
			connector,
			Arc::new(CredentialStore::new(data_dir.join(AUTH_DIR))),
			Arc::new(Ledger::new(data_dir.join(LEDGER_FILE))),
			Arc::new(SessionRegistry::new()),
			config,
		)
	}

	pub fn with_parts(
		connector: Arc<dyn Connector>,
		store: Arc<CredentialStore>,
		ledger: Arc<Ledger>,
		registry: Arc<SessionRegistry>,
		config: SupervisorConfig,
	) -> Self {
		let services = Services {
			connector,
			store,
			ledger,
			registry,
			pairing: PairingCoordinator::new(config.pairing.clone()),
			config,
		};
		Self {
			services: Arc::new(services),
			slots: Arc::new(Mutex::new(Slots::default())),
		}
	}

	pub fn registry(&self) -> &Arc<SessionRegistry> {
		&self.services.registry
	}

	pub fn store(&self) -> &Arc<CredentialStore> {
		&self.services.store
	}

	pub fn ledger(&self) -> &Arc<Ledger> {
		&self.services.ledger
	}

	pub fn config(&self) -> &SupervisorConfig {
		&self.services.config
	}

	/// Starts supervising `account` and returns its event stream.
	///
	/// Fails with [`Error::AlreadyInProgress`] while another supervisor (or a
	/// removal) owns the account; requests are rejected, never queued.
	pub fn connect(&self, account: AccountId) -> Result<StatusStream> {
		self.start(account, false)
	}

	fn start(&self, account: AccountId, resumed: bool) -> Result<StatusStream> {
		// A ledger entry means the account has connected before.
		let connected_before = resumed || self.services.ledger.contains(&account)?;
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		let (cancel_tx, cancel_rx) = watch::channel(false);

		let mut slots = self.slots.lock();
		slots.next_generation += 1;
		let generation = slots.next_generation;

		let entry = slots.accounts.entry(account.clone()).or_insert_with(AccountEntry::new);
		if entry.is_busy() {
			return Err(Error::AlreadyInProgress(account));
		}

		{
			let mut record = entry.record.lock();
			record.state = ConnectionState::Connecting;
			record.pairing = None;
			record.ever_connected |= connected_before;
		}
		let _ = events_tx.send(SessionEvent::State {
			account: account.clone(),
			state: ConnectionState::Connecting,
		});

		let supervisor = Supervisor::new(
			account.clone(),
			Arc::clone(&self.services),
			Arc::clone(&entry.record),
			events_tx,
			cancel_rx,
		);
		let slots_ref = Arc::clone(&self.slots);
		let task_account = account.clone();
		let task = tokio::spawn(async move {
			let exit = supervisor.run().await;
			debug!(target = "tether.manager", account = %task_account, ?exit, "supervisor exited");
			release_slot(&slots_ref, &task_account, generation, exit);
		});

		entry.running = Some(Running {
			generation,
			cancel: cancel_tx,
			task,
		});
		info!(target = "tether.manager", %account, resumed, connected_before, "supervisor started");

		Ok(StatusStream { rx: events_rx })
	}

	/// Ids of accounts that currently hold a live connection.
	pub fn list_active(&self) -> Vec<AccountId> {
		self.services.registry.account_ids().into_iter().collect()
	}

	pub fn handle(&self, account: &AccountId) -> Option<Arc<dyn SessionHandle>> {
		self.services.registry.get(account)
	}

	/// Cancels any supervisor for `account`, closes its connection and erases
	/// everything persisted for it. Returns only once all of that is done.
	///
	/// Unknown accounts yield [`Error::NotFound`].
	pub async fn remove(&self, account: &AccountId) -> Result<()> {
		let (running, known) = {
			let mut slots = self.slots.lock();
			match slots.accounts.get_mut(account) {
				Some(entry) if entry.removing => return Err(Error::AlreadyInProgress(account.clone())),
				Some(entry) => {
					entry.removing = true;
					(entry.running.take(), true)
				}
				None => {
					let mut entry = AccountEntry::new();
					entry.removing = true;
					slots.accounts.insert(account.clone(), entry);
					(None, false)
				}
			}
		};

		let result = self.remove_inner(account, running, known).await;
		self.slots.lock().accounts.remove(account);
		result
	}

	async fn remove_inner(&self, account: &AccountId, running: Option<Running>, known: bool) -> Result<()> {
		let was_running = running.is_some();
		if let Some(running) = running {
			let _ = running.cancel.send(true);
			if let Err(err) = running.task.await {
				warn!(target = "tether.manager", %account, error = %err, "supervisor task failed");
			}
		}

		let had_handle = match self.services.registry.unregister(account) {
			Some(handle) => {
				handle.close().await;
				true
			}
			None => false,
		};
		let erased = self.services.store.erase(account)?;
		let forgotten = self.services.ledger.remove(account)?;

		if !(known || was_running || had_handle || erased || forgotten) {
			return Err(Error::NotFound(account.clone()));
		}
		info!(target = "tether.manager", %account, erased, forgotten, "account removed");
		Ok(())
	}

	/// Current view of one account.
	pub fn status(&self, account: &AccountId) -> Result<AccountStatus> {
		let record = self.slots.lock().accounts.get(account).map(|entry| entry.record.lock().clone());
		let in_ledger = self.services.ledger.contains(account)?;
		let has_credentials = self.services.store.exists(account);

		if record.is_none() && !in_ledger && !has_credentials {
			return Err(Error::NotFound(account.clone()));
		}
		let record = record.unwrap_or_default();
		Ok(AccountStatus {
			account: account.clone(),
			state: record.state,
			ever_connected: record.ever_connected || in_ledger,
			last_disconnect: record.last_disconnect,
			in_ledger,
			has_credentials,
			pairing: record.pairing,
		})
	}

	/// Status of every account known in memory or in the ledger, sorted by id.
	pub fn accounts(&self) -> Result<Vec<AccountStatus>> {
		let mut ids: BTreeSet<AccountId> = self.slots.lock().accounts.keys().cloned().collect();
		ids.extend(self.services.ledger.load()?);

		let mut statuses = Vec::with_capacity(ids.len());
		for id in ids {
			match self.status(&id) {
				Ok(status) => statuses.push(status),
				Err(err) if err.is_not_found() => {}
				Err(err) => return Err(err),
			}
		}
		Ok(statuses)
	}

	/// Starts a supervisor for every ledger entry. Resumed accounts count as
	/// previously connected, so drops are retried rather than torn down.
	pub fn resume(&self) -> Result<Vec<AccountId>> {
		let accounts = self.services.ledger.load()?;
		info!(target = "tether.manager", count = accounts.len(), "resuming ledger accounts");

		let mut started = Vec::with_capacity(accounts.len());
		for account in accounts {
			match self.start(account.clone(), true) {
				Ok(stream) => {
					tokio::spawn(stream.log_until_closed());
					started.push(account);
				}
				Err(err) => warn!(target = "tether.manager", %account, error = %err, "not resumed"),
			}
		}
		Ok(started)
	}

	/// Stops every supervisor and closes every connection. Persisted state is
	/// kept so the next process can resume from the ledger.
	pub async fn shutdown(&self) {
		let running: Vec<(AccountId, Running)> = {
			let mut slots = self.slots.lock();
			slots
				.accounts
				.iter_mut()
				.filter_map(|(account, entry)| entry.running.take().map(|r| (account.clone(), r)))
				.collect()
		};
		info!(target = "tether.manager", count = running.len(), "shutting down supervisors");

		for (_, running) in &running {
			let _ = running.cancel.send(true);
		}
		for (account, running) in running {
			if let Err(err) = running.task.await {
				warn!(target = "tether.manager", %account, error = %err, "supervisor task failed");
			}
		}
		for account in self.services.registry.account_ids() {
			if let Some(handle) = self.services.registry.unregister(&account) {
				handle.close().await;
			}
		}

		let mut slots = self.slots.lock();
		for entry in slots.accounts.values_mut() {
			entry.record.lock().state = ConnectionState::Idle;
		}
	}
}

fn release_slot(slots: &Mutex<Slots>, account: &AccountId, generation: u64, exit: Exit) {
	let mut slots = slots.lock();
	let Some(entry) = slots.accounts.get_mut(account) else {
		return;
	};
	if !entry.running.as_ref().is_some_and(|r| r.generation == generation) {
		return;
	}
	entry.running = None;
	entry.record.lock().state = ConnectionState::Idle;
	if exit == Exit::TornDown {
		slots.accounts.remove(account);
	}
}

/// Events of one supervisor, ending when the supervisor exits.
#[derive(Debug)]
pub struct StatusStream {
	rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl StatusStream {
	pub async fn recv(&mut self) -> Option<SessionEvent> {
		self.rx.recv().await
	}

	/// Collects events until `stop` matches one (inclusive) or the stream ends.
	pub async fn collect_until(&mut self, mut stop: impl FnMut(&SessionEvent) -> bool) -> Vec<SessionEvent> {
		let mut seen = Vec::new();
		while let Some(event) = self.rx.recv().await {
			let done = stop(&event);
			seen.push(event);
			if done {
				break;
			}
		}
		seen
	}

	/// Like [`collect_until`](Self::collect_until) but gives up after `within`.
	pub async fn collect_until_timeout(&mut self, within: Duration, stop: impl FnMut(&SessionEvent) -> bool) -> Option<Vec<SessionEvent>> {
		tokio::time::timeout(within, self.collect_until(stop)).await.ok()
	}

	async fn log_until_closed(mut self) {
		while let Some(event) = self.rx.recv().await {
			debug!(target = "tether.manager", account = %event.account(), ?event, "resumed account event");
		}
	}
}

impl Stream for StatusStream {
	type Item = SessionEvent;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		self.rx.poll_recv(cx)
	}
}
