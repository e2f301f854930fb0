//! Control daemon: one [`SessionManager`] behind a local socket speaking
//! newline-delimited JSON ([`ControlRequest`] in, [`ControlResponse`] out).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tether_protocol::{AccountId, ConnectionState, ControlRequest, ControlResponse, ErrorKind};
use tether_runtime::SessionManager;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
#[cfg(not(unix))]
use tokio::net::TcpListener as Listener;
#[cfg(unix)]
use tokio::net::UnixListener as Listener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{CliError, Result};

/// Loopback port used instead of a socket file where Unix sockets are unavailable.
#[cfg(not(unix))]
pub const DAEMON_TCP_PORT: u16 = 7301;

/// Stops a running [`Daemon`]; cloneable and usable from any task.
#[derive(Clone)]
pub struct ShutdownHandle {
	tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
	fn new() -> Self {
		Self {
			tx: Arc::new(watch::Sender::new(false)),
		}
	}

	pub fn trigger(&self) {
		self.tx.send_replace(true);
	}

	fn subscribe(&self) -> watch::Receiver<bool> {
		self.tx.subscribe()
	}
}

pub struct Daemon {
	manager: Arc<SessionManager>,
	listener: Listener,
	socket_path: PathBuf,
	shutdown: ShutdownHandle,
}

impl Daemon {
	/// Binds the control socket. A leftover socket file is replaced unless a
	/// daemon still answers on it.
	#[cfg(unix)]
	pub async fn bind(manager: Arc<SessionManager>, socket_path: &Path) -> Result<Self> {
		use std::os::unix::fs::PermissionsExt;

		if socket_path.exists() {
			if tokio::net::UnixStream::connect(socket_path).await.is_ok() {
				return Err(CliError::Daemon(format!("already running at {}", socket_path.display())));
			}
			debug!(target = "tether.daemon", path = %socket_path.display(), "removing stale socket");
			std::fs::remove_file(socket_path)?;
		}
		if let Some(parent) = socket_path.parent() {
			std::fs::create_dir_all(parent)?;
		}

		let listener = Listener::bind(socket_path)?;
		// Only the owning user may drive the daemon.
		std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;

		Ok(Self {
			manager,
			listener,
			socket_path: socket_path.to_path_buf(),
			shutdown: ShutdownHandle::new(),
		})
	}

	#[cfg(not(unix))]
	pub async fn bind(manager: Arc<SessionManager>, socket_path: &Path) -> Result<Self> {
		let listener = Listener::bind(("127.0.0.1", DAEMON_TCP_PORT))
			.await
			.map_err(|e| CliError::Daemon(format!("bind 127.0.0.1:{DAEMON_TCP_PORT}: {e}")))?;
		Ok(Self {
			manager,
			listener,
			socket_path: socket_path.to_path_buf(),
			shutdown: ShutdownHandle::new(),
		})
	}

	pub fn socket_path(&self) -> &Path {
		&self.socket_path
	}

	pub fn shutdown_handle(&self) -> ShutdownHandle {
		self.shutdown.clone()
	}

	/// Serves clients until a `shutdown` request or [`ShutdownHandle::trigger`],
	/// then stops every supervisor.
	pub async fn run(self) -> Result<()> {
		let mut stop = self.shutdown.subscribe();
		info!(target = "tether.daemon", socket = %self.socket_path.display(), "daemon listening");

		loop {
			tokio::select! {
				_ = stopped(&mut stop) => break,
				accepted = self.listener.accept() => match accepted {
					Ok((stream, _)) => {
						let manager = Arc::clone(&self.manager);
						let shutdown = self.shutdown.clone();
						tokio::spawn(async move {
							if let Err(err) = serve_connection(stream, manager, shutdown).await {
								debug!(target = "tether.daemon", error = %err, "client connection ended");
							}
						});
					}
					Err(err) => warn!(target = "tether.daemon", error = %err, "accept failed"),
				},
			}
		}

		info!(target = "tether.daemon", "shutting down");
		self.manager.shutdown().await;
		#[cfg(unix)]
		{
			let _ = std::fs::remove_file(&self.socket_path);
		}
		Ok(())
	}
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
	loop {
		if *stop.borrow_and_update() {
			return;
		}
		if stop.changed().await.is_err() {
			return;
		}
	}
}

async fn serve_connection<S>(stream: S, manager: Arc<SessionManager>, shutdown: ShutdownHandle) -> std::io::Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let (reader, mut writer) = tokio::io::split(stream);
	let mut lines = BufReader::new(reader).lines();

	while let Some(line) = lines.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let request = match parse_request(&line) {
			Ok(request) => request,
			Err(rejection) => {
				write_response(&mut writer, &rejection).await?;
				continue;
			}
		};
		debug!(target = "tether.daemon", ?request, "request");

		let stop = matches!(request, ControlRequest::Shutdown);
		handle_request(request, &manager, &mut writer).await?;
		if stop {
			shutdown.trigger();
			break;
		}
	}
	Ok(())
}

/// Decodes one request line. The `account` field is validated first so a bad
/// id is reported as such rather than as a generic decode error.
fn parse_request(line: &str) -> std::result::Result<ControlRequest, ControlResponse> {
	let malformed = |err: serde_json::Error| ControlResponse::error(ErrorKind::Internal, format!("malformed request: {err}"));

	let value: serde_json::Value = serde_json::from_str(line).map_err(malformed)?;
	if let Some(raw) = value.get("account").and_then(serde_json::Value::as_str) {
		if let Err(err) = AccountId::new(raw) {
			return Err(ControlResponse::error(ErrorKind::InvalidAccount, err.to_string()));
		}
	}
	serde_json::from_value(value).map_err(malformed)
}

async fn handle_request<W>(request: ControlRequest, manager: &SessionManager, writer: &mut W) -> std::io::Result<()>
where
	W: AsyncWrite + Unpin,
{
	let response = match request {
		ControlRequest::Ping => ControlResponse::Pong,
		ControlRequest::ListActive => ControlResponse::Accounts {
			accounts: manager.list_active(),
		},
		ControlRequest::Remove { account } => match manager.remove(&account).await {
			Ok(()) => ControlResponse::Ok,
			Err(err) => ControlResponse::error(err.kind(), err.to_string()),
		},
		ControlRequest::Status { account } => {
			let statuses = match account {
				Some(account) => manager.status(&account).map(|status| vec![status]),
				None => manager.accounts(),
			};
			match statuses {
				Ok(accounts) => ControlResponse::Status { accounts },
				Err(err) => ControlResponse::error(err.kind(), err.to_string()),
			}
		}
		ControlRequest::Shutdown => ControlResponse::Ok,
		ControlRequest::Connect { account } => {
			let mut stream = match manager.connect(account) {
				Ok(stream) => stream,
				Err(err) => return write_response(writer, &ControlResponse::error(err.kind(), err.to_string())).await,
			};
			// Forward events until the account is up or its supervisor gives up.
			while let Some(event) = stream.recv().await {
				let connected = event.state() == Some(ConnectionState::Connected);
				write_response(writer, &ControlResponse::Event { event }).await?;
				if connected {
					break;
				}
			}
			ControlResponse::Done
		}
	};
	write_response(writer, &response).await
}

async fn write_response<W>(writer: &mut W, response: &ControlResponse) -> std::io::Result<()>
where
	W: AsyncWrite + Unpin,
{
	let mut line = serde_json::to_string(response).map_err(std::io::Error::other)?;
	line.push('\n');
	writer.write_all(line.as_bytes()).await?;
	writer.flush().await
}
