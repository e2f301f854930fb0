//! Subcommand implementations. Each prints one result envelope and reports
//! whether it succeeded.

use std::sync::Arc;

use colored::Colorize;
use serde::Serialize;
use tether_protocol::{AccountId, ConnectionState, ControlRequest, ControlResponse, SessionEvent, format_pairing_code};
use tether_runtime::{SessionManager, WsConnector};
use tracing::{info, warn};

use crate::cli::Commands;
use crate::client::DaemonClient;
use crate::config::Settings;
use crate::daemon::Daemon;
use crate::error::Result;
use crate::output::{
	CommandResult, ConnectData, DaemonData, ErrorCode, ListData, OutputFormat, RemoveData, ResultBuilder, StatusData, print_result,
};

pub async fn dispatch(command: Commands, settings: Settings, format: OutputFormat) -> Result<bool> {
	let client = DaemonClient::new(&settings.socket_path);
	match command {
		Commands::Serve => serve(settings, format).await,
		Commands::Connect { account } => connect(&client, account, format).await,
		Commands::List => list(&client, format).await,
		Commands::Remove { account } => remove(&client, account, format).await,
		Commands::Status { account } => status(&client, account, format).await,
		Commands::Ping => ping(&client, format).await,
		Commands::Shutdown => shutdown(&client, format).await,
	}
}

fn finish<T: Serialize>(result: CommandResult<T>, format: OutputFormat) -> bool {
	print_result(&result, format);
	result.ok
}

fn not_running<T: Serialize>(builder: ResultBuilder<T>, client: &DaemonClient) -> ResultBuilder<T> {
	builder.error(
		ErrorCode::DaemonNotRunning,
		format!("no daemon at {} (start one with `tether serve`)", client.socket_path().display()),
	)
}

fn unexpected<T: Serialize>(builder: ResultBuilder<T>, response: ControlResponse) -> ResultBuilder<T> {
	match response {
		ControlResponse::Error { kind, message } => builder.error(kind.into(), message),
		other => builder.error(ErrorCode::InternalError, format!("unexpected daemon response: {other:?}")),
	}
}

async fn serve(settings: Settings, format: OutputFormat) -> Result<bool> {
	let connector = WsConnector::new(settings.gateway_url.clone());
	let manager = Arc::new(SessionManager::new(Arc::new(connector), &settings.data_dir, settings.supervisor.clone()));

	let daemon = Daemon::bind(Arc::clone(&manager), &settings.socket_path).await?;
	let resumed = manager.resume()?;
	info!(target = "tether.daemon", count = resumed.len(), gateway = %settings.gateway_url, "resumed ledger accounts");

	let result = ResultBuilder::new("serve")
		.data(DaemonData {
			running: true,
			socket: settings.socket_path.display().to_string(),
			message: Some(format!("resumed {} account(s)", resumed.len())),
		})
		.build();
	print_result(&result, format);

	let shutdown = daemon.shutdown_handle();
	tokio::spawn(async move {
		match tokio::signal::ctrl_c().await {
			Ok(()) => shutdown.trigger(),
			Err(err) => warn!(target = "tether.daemon", error = %err, "cannot listen for Ctrl-C"),
		}
	});

	daemon.run().await?;
	Ok(true)
}

async fn connect(client: &DaemonClient, account: AccountId, format: OutputFormat) -> Result<bool> {
	let builder = ResultBuilder::new("connect");
	let mut events: Vec<SessionEvent> = Vec::new();
	let mut pairing_code = None;

	let request = ControlRequest::Connect { account: account.clone() };
	let response = client
		.exchange(&request, |event| {
			if let SessionEvent::PairingCode { account, code } = event {
				let shown = format_pairing_code(code);
				eprintln!("{} {}: {}", "Pairing code for".cyan(), account, shown.bold());
				pairing_code = Some(shown);
			}
			events.push(event.clone());
		})
		.await?;

	let builder = match response {
		None => not_running(builder, client),
		Some(ControlResponse::Done) => match outcome(&events) {
			Ok(state) => builder.data(ConnectData {
				account,
				state,
				pairing_code,
				events,
			}),
			Err((code, message)) => builder.error(code, message),
		},
		Some(other) => unexpected(builder, other),
	};
	Ok(finish(builder.build(), format))
}

/// Final state of a connect stream, or why the account did not come up.
fn outcome(events: &[SessionEvent]) -> std::result::Result<ConnectionState, (ErrorCode, String)> {
	for event in events.iter().rev() {
		match event {
			SessionEvent::Failed { kind, message, .. } => return Err(((*kind).into(), message.clone())),
			SessionEvent::Terminated { code, .. } => {
				let code = code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string());
				return Err((ErrorCode::Disconnected, format!("session terminated (code {code})")));
			}
			_ => {}
		}
	}
	let state = events.iter().rev().find_map(SessionEvent::state).unwrap_or_default();
	Ok(state)
}

async fn list(client: &DaemonClient, format: OutputFormat) -> Result<bool> {
	let builder = ResultBuilder::new("list");
	let builder = match client.request(&ControlRequest::ListActive).await? {
		None => not_running(builder, client),
		Some(ControlResponse::Accounts { accounts }) => builder.data(ListData {
			count: accounts.len(),
			accounts,
		}),
		Some(other) => unexpected(builder, other),
	};
	Ok(finish(builder.build(), format))
}

async fn remove(client: &DaemonClient, account: AccountId, format: OutputFormat) -> Result<bool> {
	let builder = ResultBuilder::new("remove");
	let request = ControlRequest::Remove { account: account.clone() };
	let builder = match client.request(&request).await? {
		None => not_running(builder, client),
		Some(ControlResponse::Ok) => builder.data(RemoveData { account, removed: true }),
		Some(other) => unexpected(builder, other),
	};
	Ok(finish(builder.build(), format))
}

async fn status(client: &DaemonClient, account: Option<AccountId>, format: OutputFormat) -> Result<bool> {
	let builder = ResultBuilder::new("status");
	let builder = match client.request(&ControlRequest::Status { account }).await? {
		None => not_running(builder, client),
		Some(ControlResponse::Status { accounts }) => builder.data(StatusData { accounts }),
		Some(other) => unexpected(builder, other),
	};
	Ok(finish(builder.build(), format))
}

async fn ping(client: &DaemonClient, format: OutputFormat) -> Result<bool> {
	let socket = client.socket_path().display().to_string();
	let builder = ResultBuilder::new("ping");
	let builder = match client.request(&ControlRequest::Ping).await? {
		None => builder.data(DaemonData {
			running: false,
			socket,
			message: Some("daemon not running".to_string()),
		}),
		Some(ControlResponse::Pong) => builder.data(DaemonData {
			running: true,
			socket,
			message: None,
		}),
		Some(other) => unexpected(builder, other),
	};
	Ok(finish(builder.build(), format))
}

async fn shutdown(client: &DaemonClient, format: OutputFormat) -> Result<bool> {
	let socket = client.socket_path().display().to_string();
	let builder = ResultBuilder::new("shutdown");
	let builder = match client.request(&ControlRequest::Shutdown).await? {
		None => builder.data(DaemonData {
			running: false,
			socket,
			message: Some("daemon not running".to_string()),
		}),
		Some(ControlResponse::Ok) => builder.data(DaemonData {
			running: false,
			socket,
			message: Some("daemon stopping".to_string()),
		}),
		Some(other) => unexpected(builder, other),
	};
	Ok(finish(builder.build(), format))
}
