use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tether_protocol::{AccountId, ConnectionState, ErrorKind, SessionEvent};
use tether_runtime::transport::fake::{FakeConnector, FakeConnectorBuilder, FakeController, Pairing, Script};
use tether_runtime::{Credentials, Error, LinkEvent, PairingConfig, SessionHandle, SessionManager, StatusStream, SupervisorConfig};

const WAIT: Duration = Duration::from_secs(5);

fn id(s: &str) -> AccountId {
	AccountId::new(s).expect("valid account id")
}

fn fast_config() -> SupervisorConfig {
	SupervisorConfig {
		reconnect_delay: Duration::from_millis(10),
		pairing: PairingConfig {
			settle_delay: Duration::from_millis(1),
			request_timeout: Duration::from_millis(50),
			window: Duration::from_millis(200),
		},
	}
}

fn creds(tag: &str) -> Credentials {
	Credentials::new(json!({ "me": tag, "keys": { "noise": "abc" } }))
}

fn manager_with(builder: FakeConnectorBuilder, dir: &TempDir) -> (SessionManager, FakeController) {
	manager_with_config(builder, dir, fast_config())
}

fn manager_with_config(builder: FakeConnectorBuilder, dir: &TempDir, config: SupervisorConfig) -> (SessionManager, FakeController) {
	let (connector, controller): (FakeConnector, FakeController) = builder.build();
	let manager = SessionManager::new(Arc::new(connector), dir.path(), config);
	(manager, controller)
}

/// Pairing requests stay pending for the whole test.
fn patient_config() -> SupervisorConfig {
	let mut config = fast_config();
	config.pairing.request_timeout = Duration::from_secs(30);
	config
}

fn is_state(state: ConnectionState) -> impl Fn(&SessionEvent) -> bool {
	move |event| event.state() == Some(state)
}

async fn until(stream: &mut StatusStream, stop: impl FnMut(&SessionEvent) -> bool) -> Vec<SessionEvent> {
	stream.collect_until_timeout(WAIT, stop).await.expect("event did not arrive in time")
}

async fn until_end(stream: &mut StatusStream) -> Vec<SessionEvent> {
	until(stream, |_| false).await
}

#[tokio::test]
async fn first_time_pairing_connects_and_persists() {
	let dir = TempDir::new().unwrap();
	let account = id("1000");
	let builder = FakeConnectorBuilder::new().pairing(Pairing::IssueAndAccept {
		code: "K7P2QX9M".into(),
		credentials: creds("1000"),
	});
	let (manager, controller) = manager_with(builder, &dir);

	let mut stream = manager.connect(account.clone()).unwrap();
	let events = until(&mut stream, is_state(ConnectionState::Connected)).await;

	assert_eq!(
		events,
		vec![
			SessionEvent::State { account: account.clone(), state: ConnectionState::Connecting },
			SessionEvent::State { account: account.clone(), state: ConnectionState::AwaitingPairingCode },
			SessionEvent::PairingCode { account: account.clone(), code: "K7P2QX9M".into() },
			SessionEvent::State { account: account.clone(), state: ConnectionState::Connecting },
			SessionEvent::State { account: account.clone(), state: ConnectionState::Connected },
		]
	);

	assert_eq!(manager.list_active(), vec![account.clone()]);
	assert!(manager.handle(&account).is_some());
	assert_eq!(manager.store().load(&account).unwrap(), Some(creds("1000")));
	assert!(manager.ledger().contains(&account).unwrap());
	assert!(controller.attempts(&account)[0].credentials.is_none());

	let status = manager.status(&account).unwrap();
	assert_eq!(status.state, ConnectionState::Connected);
	assert!(status.ever_connected);
	assert!(status.in_ledger);
	assert!(status.has_credentials);
	assert!(status.pairing.is_none());

	manager.shutdown().await;
}

#[tokio::test]
async fn server_drop_reconnects_with_same_credentials_and_no_pairing() {
	let dir = TempDir::new().unwrap();
	let account = id("2000");
	let (manager, controller) = manager_with(FakeConnectorBuilder::new().default_script(Script::Open), &dir);
	manager.store().save(&account, &creds("2000")).unwrap();

	let mut stream = manager.connect(account.clone()).unwrap();
	let first = until(&mut stream, is_state(ConnectionState::Connected)).await;

	assert!(controller.inject(&account, LinkEvent::Closed { code: Some(503), reason: None }));
	let events = until(&mut stream, is_state(ConnectionState::Connected)).await;

	let states: Vec<_> = first.iter().chain(&events).filter_map(SessionEvent::state).collect();
	assert_eq!(
		states,
		vec![
			ConnectionState::Connecting,
			ConnectionState::Connected,
			ConnectionState::Connecting,
			ConnectionState::Connected,
		]
	);
	assert!(events.contains(&SessionEvent::Reconnecting {
		account: account.clone(),
		code: Some(503),
		delay_ms: 10,
	}));
	let attempts = controller.attempts(&account);
	assert_eq!(attempts.len(), 2);
	assert!(attempts.iter().all(|a| a.credentials == Some(creds("2000"))));
	assert_eq!(controller.latest_handle(&account).unwrap().pairing_requests(), 0);
	assert_eq!(manager.list_active(), vec![account.clone()]);

	let status = manager.status(&account).unwrap();
	assert_eq!(status.last_disconnect.unwrap().code, Some(503));

	manager.shutdown().await;
}

#[tokio::test]
async fn immediate_logout_leaves_account_idle_and_unrecorded() {
	let dir = TempDir::new().unwrap();
	let account = id("1000");
	let (manager, controller) = manager_with(FakeConnectorBuilder::new(), &dir);
	manager.store().save(&account, &creds("1000")).unwrap();
	controller.script(&account, [Script::Close(Some(401))]);

	let mut stream = manager.connect(account.clone()).unwrap();
	let events = until_end(&mut stream).await;

	let states: Vec<_> = events.iter().filter_map(SessionEvent::state).collect();
	assert_eq!(
		states,
		vec![ConnectionState::Connecting, ConnectionState::Terminating, ConnectionState::Idle]
	);
	assert!(manager.list_active().is_empty());
	assert!(!manager.ledger().contains(&account).unwrap());
	assert!(!manager.store().exists(&account));
	assert_eq!(controller.attempt_count(&account), 1);
}

#[tokio::test]
async fn logout_before_first_connect_tears_down_without_retry() {
	let dir = TempDir::new().unwrap();
	let account = id("3000");
	let (manager, controller) = manager_with(FakeConnectorBuilder::new().pairing(Pairing::Issue("ABCDEFGH".into())), &dir);

	let mut stream = manager.connect(account.clone()).unwrap();
	until(&mut stream, |e| matches!(e, SessionEvent::PairingCode { .. })).await;

	assert!(controller.inject(&account, LinkEvent::Closed { code: Some(401), reason: None }));
	let events = until_end(&mut stream).await;

	assert!(events.contains(&SessionEvent::Terminated { account: account.clone(), code: Some(401) }));
	assert_eq!(events.last().and_then(SessionEvent::state), Some(ConnectionState::Idle));

	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(controller.attempt_count(&account), 1);
	assert!(!manager.store().exists(&account));
	assert!(!manager.ledger().contains(&account).unwrap());
	assert!(manager.status(&account).unwrap_err().is_not_found());
}

#[tokio::test]
async fn close_before_first_connect_is_a_pairing_failure() {
	let dir = TempDir::new().unwrap();
	let account = id("3001");
	let (manager, controller) = manager_with(FakeConnectorBuilder::new(), &dir);

	let mut stream = manager.connect(account.clone()).unwrap();
	until(&mut stream, |e| matches!(e, SessionEvent::PairingCode { .. })).await;
	controller.inject(&account, LinkEvent::Closed { code: Some(428), reason: Some("closed".into()) });

	let events = until_end(&mut stream).await;
	assert!(events.iter().any(|e| matches!(e, SessionEvent::Failed { kind: ErrorKind::PairingFailure, .. })));

	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(controller.attempt_count(&account), 1);
}

#[tokio::test]
async fn logout_after_connect_erases_everything() {
	let dir = TempDir::new().unwrap();
	let account = id("4000");
	let (manager, controller) = manager_with(FakeConnectorBuilder::new().default_script(Script::Open), &dir);
	manager.store().save(&account, &creds("4000")).unwrap();

	let mut stream = manager.connect(account.clone()).unwrap();
	until(&mut stream, is_state(ConnectionState::Connected)).await;
	assert!(manager.ledger().contains(&account).unwrap());

	controller.inject(&account, LinkEvent::Closed { code: Some(401), reason: None });
	until_end(&mut stream).await;

	assert!(manager.list_active().is_empty());
	assert!(!manager.store().account_dir(&account).exists());
	assert!(!manager.ledger().contains(&account).unwrap());
	assert_eq!(controller.attempt_count(&account), 1);
}

#[tokio::test]
async fn keeps_retrying_until_the_link_opens() {
	let dir = TempDir::new().unwrap();
	let account = id("5000");
	let (manager, controller) = manager_with(FakeConnectorBuilder::new(), &dir);
	manager.store().save(&account, &creds("5000")).unwrap();
	controller.script(&account, [Script::Open]);

	let mut stream = manager.connect(account.clone()).unwrap();
	until(&mut stream, is_state(ConnectionState::Connected)).await;

	controller.script(
		&account,
		[
			Script::FailOpen("refused".into()),
			Script::FailOpen("refused".into()),
			Script::Close(Some(408)),
			Script::FailOpen("refused".into()),
			Script::Open,
		],
	);
	controller.inject(&account, LinkEvent::Closed { code: Some(515), reason: None });

	let events = until(&mut stream, is_state(ConnectionState::Connected)).await;
	let retries = events.iter().filter(|e| matches!(e, SessionEvent::Reconnecting { .. })).count();
	assert_eq!(retries, 5);
	assert_eq!(controller.attempt_count(&account), 6);
	assert_eq!(manager.list_active(), vec![account.clone()]);

	manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connects_start_one_supervisor() {
	let dir = TempDir::new().unwrap();
	let account = id("6000");
	let (manager, controller) = manager_with_config(FakeConnectorBuilder::new().pairing(Pairing::Hang), &dir, patient_config());
	let manager = Arc::new(manager);

	let tasks: Vec<_> = (0..16)
		.map(|_| {
			let manager = Arc::clone(&manager);
			let account = account.clone();
			tokio::spawn(async move { manager.connect(account) })
		})
		.collect();

	let mut accepted = Vec::new();
	let mut rejected = 0;
	for task in tasks {
		match task.await.unwrap() {
			Ok(stream) => accepted.push(stream),
			Err(Error::AlreadyInProgress(rejected_account)) => {
				assert_eq!(rejected_account, account);
				rejected += 1;
			}
			Err(other) => panic!("unexpected error: {other}"),
		}
	}
	assert_eq!(accepted.len(), 1);
	assert_eq!(rejected, 15);

	assert!(controller.wait_for_attempts(&account, 1, WAIT).await);
	tokio::time::sleep(Duration::from_millis(30)).await;
	assert_eq!(controller.attempt_count(&account), 1);

	manager.remove(&account).await.unwrap();
}

#[tokio::test]
async fn connect_after_exit_is_accepted_again() {
	let dir = TempDir::new().unwrap();
	let account = id("6001");
	let (manager, _controller) = manager_with(FakeConnectorBuilder::new().pairing(Pairing::Reject("not registered".into())), &dir);

	let mut stream = manager.connect(account.clone()).unwrap();
	until_end(&mut stream).await;
	tokio::time::sleep(Duration::from_millis(20)).await;

	assert!(manager.connect(account.clone()).is_ok());
}

#[tokio::test]
async fn remove_clears_registry_ledger_and_credentials() {
	let dir = TempDir::new().unwrap();
	let account = id("7000");
	let other = id("7001");
	let (manager, controller) = manager_with(FakeConnectorBuilder::new().default_script(Script::Open), &dir);
	manager.store().save(&account, &creds("7000")).unwrap();
	manager.store().save(&other, &creds("7001")).unwrap();

	let mut stream = manager.connect(account.clone()).unwrap();
	let mut other_stream = manager.connect(other.clone()).unwrap();
	until(&mut stream, is_state(ConnectionState::Connected)).await;
	until(&mut other_stream, is_state(ConnectionState::Connected)).await;

	manager.remove(&account).await.unwrap();

	assert_eq!(manager.list_active(), vec![other.clone()]);
	assert!(manager.handle(&account).is_none());
	assert!(!manager.store().account_dir(&account).exists());
	assert!(!manager.ledger().contains(&account).unwrap());
	assert!(controller.latest_handle(&account).unwrap().is_closed());
	assert!(manager.status(&account).unwrap_err().is_not_found());

	assert!(manager.store().exists(&other));
	assert!(manager.ledger().contains(&other).unwrap());

	assert!(manager.remove(&account).await.unwrap_err().is_not_found());
	manager.shutdown().await;
}

#[tokio::test]
async fn remove_cancels_a_pending_pairing() {
	let dir = TempDir::new().unwrap();
	let account = id("7100");
	let (manager, controller) = manager_with_config(FakeConnectorBuilder::new().pairing(Pairing::Hang), &dir, patient_config());

	let mut stream = manager.connect(account.clone()).unwrap();
	until(&mut stream, is_state(ConnectionState::AwaitingPairingCode)).await;

	tokio::time::timeout(WAIT, manager.remove(&account)).await.unwrap().unwrap();
	assert!(controller.latest_handle(&account).unwrap().is_closed());
	assert!(manager.connect(account).is_ok());
}

#[tokio::test]
async fn remove_interrupts_reconnect_backoff() {
	let dir = TempDir::new().unwrap();
	let account = id("7200");
	let mut config = fast_config();
	config.reconnect_delay = Duration::from_secs(60);
	let (manager, controller) = manager_with_config(FakeConnectorBuilder::new().default_script(Script::Open), &dir, config);
	manager.store().save(&account, &creds("7200")).unwrap();

	let mut stream = manager.connect(account.clone()).unwrap();
	until(&mut stream, is_state(ConnectionState::Connected)).await;
	controller.inject(&account, LinkEvent::Closed { code: Some(503), reason: None });
	until(&mut stream, |e| matches!(e, SessionEvent::Reconnecting { .. })).await;

	tokio::time::timeout(Duration::from_secs(2), manager.remove(&account))
		.await
		.expect("remove waited out the backoff")
		.unwrap();

	assert!(manager.list_active().is_empty());
	assert!(manager.handle(&account).is_none());
	assert!(!manager.store().account_dir(&account).exists());
	assert!(!manager.ledger().contains(&account).unwrap());
	assert_eq!(controller.attempt_count(&account), 1);
	until_end(&mut stream).await;
}

#[tokio::test]
async fn remove_unknown_account_is_not_found() {
	let dir = TempDir::new().unwrap();
	let (manager, _controller) = manager_with(FakeConnectorBuilder::new(), &dir);

	let err = manager.remove(&id("nobody")).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn unanswered_pairing_request_fails_once() {
	let dir = TempDir::new().unwrap();
	let account = id("8000");
	let (manager, controller) = manager_with(FakeConnectorBuilder::new().pairing(Pairing::Hang), &dir);

	let mut stream = manager.connect(account.clone()).unwrap();
	let events = until_end(&mut stream).await;

	let failure = events.iter().find_map(|e| match e {
		SessionEvent::Failed { kind, message, .. } => Some((*kind, message.clone())),
		_ => None,
	});
	let (kind, message) = failure.expect("failure event");
	assert_eq!(kind, ErrorKind::PairingFailure);
	assert!(message.contains("no pairing code within 50ms"));
	assert_eq!(controller.attempt_count(&account), 1);
	assert!(controller.latest_handle(&account).unwrap().is_closed());
}

#[tokio::test]
async fn unused_pairing_code_expires() {
	let dir = TempDir::new().unwrap();
	let account = id("8100");
	let (manager, _controller) = manager_with(FakeConnectorBuilder::new(), &dir);

	let mut stream = manager.connect(account.clone()).unwrap();
	until(&mut stream, |e| matches!(e, SessionEvent::PairingCode { .. })).await;

	let status = manager.status(&account).unwrap();
	assert_eq!(status.state, ConnectionState::AwaitingPairingCode);
	assert_eq!(status.pairing.and_then(|p| p.code).as_deref(), Some("ABCDEFGH"));

	let events = until_end(&mut stream).await;
	assert!(events.iter().any(|e| matches!(
		e,
		SessionEvent::Failed { kind: ErrorKind::PairingFailure, message, .. } if message.contains("not used")
	)));
}

#[tokio::test]
async fn unreadable_credentials_abort_without_teardown() {
	let dir = TempDir::new().unwrap();
	let account = id("9000");
	let (manager, controller) = manager_with(FakeConnectorBuilder::new().default_script(Script::Open), &dir);
	std::fs::create_dir_all(manager.store().account_dir(&account)).unwrap();
	std::fs::write(manager.store().account_dir(&account).join("creds.json"), b"{ not json").unwrap();

	let mut stream = manager.connect(account.clone()).unwrap();
	let events = until_end(&mut stream).await;

	assert!(events.iter().any(|e| matches!(e, SessionEvent::Failed { kind: ErrorKind::StorageError, .. })));
	assert_eq!(controller.attempt_count(&account), 0);
	assert!(manager.store().account_dir(&account).join("creds.json").exists());

	tokio::time::sleep(Duration::from_millis(20)).await;
	assert_eq!(manager.status(&account).unwrap().state, ConnectionState::Idle);
}

#[tokio::test]
async fn failed_credential_update_aborts_and_keeps_stored_state() {
	let dir = TempDir::new().unwrap();
	let account = id("9100");
	let (manager, controller) = manager_with(FakeConnectorBuilder::new().default_script(Script::Manual), &dir);
	manager.store().save(&account, &creds("9100")).unwrap();
	// A directory where the temp file goes makes every save fail.
	std::fs::create_dir_all(manager.store().account_dir(&account).join("creds.json.tmp")).unwrap();

	let mut stream = manager.connect(account.clone()).unwrap();
	assert!(controller.wait_for_attempts(&account, 1, WAIT).await);
	assert!(controller.inject(&account, LinkEvent::CredentialsUpdated(creds("rotated"))));
	let events = until_end(&mut stream).await;

	assert!(events.iter().any(|e| matches!(e, SessionEvent::Failed { kind: ErrorKind::StorageError, .. })));
	assert_eq!(events.last().and_then(SessionEvent::state), Some(ConnectionState::Idle));
	assert!(controller.latest_handle(&account).unwrap().is_closed());
	assert_eq!(manager.store().load(&account).unwrap(), Some(creds("9100")));
	assert!(!manager.ledger().contains(&account).unwrap());
	assert_eq!(controller.attempt_count(&account), 1);

	tokio::time::sleep(Duration::from_millis(20)).await;
	assert_eq!(manager.status(&account).unwrap().state, ConnectionState::Idle);
}

#[tokio::test]
async fn failed_ledger_insert_aborts_before_registering() {
	let dir = TempDir::new().unwrap();
	let account = id("9200");
	let (manager, controller) = manager_with(FakeConnectorBuilder::new().default_script(Script::Open), &dir);
	manager.store().save(&account, &creds("9200")).unwrap();
	std::fs::create_dir_all(dir.path().join("sessions.json.tmp")).unwrap();

	let mut stream = manager.connect(account.clone()).unwrap();
	let events = until_end(&mut stream).await;

	assert!(events.iter().any(|e| matches!(e, SessionEvent::Failed { kind: ErrorKind::StorageError, .. })));
	assert!(!events.iter().any(|e| e.state() == Some(ConnectionState::Connected)));
	assert_eq!(events.last().and_then(SessionEvent::state), Some(ConnectionState::Idle));
	assert!(manager.list_active().is_empty());
	assert!(controller.latest_handle(&account).unwrap().is_closed());
	assert!(!dir.path().join("sessions.json").exists());
	assert!(manager.store().exists(&account));
	assert_eq!(controller.attempt_count(&account), 1);
}

#[tokio::test]
async fn ledger_survives_restart_and_resume_reuses_credentials() {
	let dir = TempDir::new().unwrap();
	let account = id("1000");

	{
		let builder = FakeConnectorBuilder::new().pairing(Pairing::IssueAndAccept {
			code: "K7P2QX9M".into(),
			credentials: creds("1000"),
		});
		let (manager, _controller) = manager_with(builder, &dir);
		let mut stream = manager.connect(account.clone()).unwrap();
		until(&mut stream, is_state(ConnectionState::Connected)).await;
		manager.shutdown().await;

		assert!(manager.list_active().is_empty());
		assert!(manager.ledger().contains(&account).unwrap());
	}

	let (manager, controller) = manager_with(FakeConnectorBuilder::new().default_script(Script::Open), &dir);
	assert_eq!(manager.resume().unwrap(), vec![account.clone()]);
	assert!(controller.wait_for_attempts(&account, 1, WAIT).await);

	let deadline = tokio::time::Instant::now() + WAIT;
	while manager.list_active().is_empty() && tokio::time::Instant::now() < deadline {
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	assert_eq!(manager.list_active(), vec![account.clone()]);
	assert_eq!(controller.attempts(&account)[0].credentials, Some(creds("1000")));
	assert_eq!(controller.latest_handle(&account).unwrap().pairing_requests(), 0);

	let accounts = manager.accounts().unwrap();
	assert_eq!(accounts.len(), 1);
	assert!(accounts[0].ever_connected);

	manager.shutdown().await;
}

#[tokio::test]
async fn resumed_account_retries_instead_of_tearing_down() {
	let dir = TempDir::new().unwrap();
	let account = id("1100");
	let (manager, controller) = manager_with(FakeConnectorBuilder::new(), &dir);
	manager.store().save(&account, &creds("1100")).unwrap();
	manager.ledger().insert(&account).unwrap();
	controller.script(&account, [Script::Close(Some(428)), Script::Open]);

	manager.resume().unwrap();
	assert!(controller.wait_for_attempts(&account, 2, WAIT).await);
	assert!(manager.store().exists(&account));
	assert!(manager.ledger().contains(&account).unwrap());

	manager.shutdown().await;
}

#[tokio::test]
async fn connect_on_ledger_account_retries_instead_of_tearing_down() {
	let dir = TempDir::new().unwrap();
	let account = id("1200");
	let (manager, controller) = manager_with(FakeConnectorBuilder::new(), &dir);
	manager.store().save(&account, &creds("1200")).unwrap();
	manager.ledger().insert(&account).unwrap();
	controller.script(&account, [Script::Close(Some(428)), Script::Open]);
	assert!(manager.status(&account).unwrap().ever_connected);

	let mut stream = manager.connect(account.clone()).unwrap();
	let events = until(&mut stream, is_state(ConnectionState::Connected)).await;

	assert!(events.contains(&SessionEvent::Reconnecting {
		account: account.clone(),
		code: Some(428),
		delay_ms: 10,
	}));
	assert!(!events.iter().any(|e| matches!(e, SessionEvent::Failed { .. })));
	assert_eq!(controller.attempt_count(&account), 2);
	assert!(manager.store().exists(&account));
	assert!(manager.ledger().contains(&account).unwrap());
	assert_eq!(manager.list_active(), vec![account.clone()]);

	manager.shutdown().await;
}
