//! Client side of the daemon control socket.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tether_protocol::{ControlRequest, ControlResponse, SessionEvent};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
#[cfg(not(unix))]
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(not(unix))]
use crate::daemon::DAEMON_TCP_PORT;
use crate::error::{CliError, Result};

pub struct DaemonClient {
	socket_path: PathBuf,
}

impl DaemonClient {
	pub fn new(socket_path: impl Into<PathBuf>) -> Self {
		Self {
			socket_path: socket_path.into(),
		}
	}

	pub fn socket_path(&self) -> &Path {
		&self.socket_path
	}

	/// Sends one request and returns the daemon's answer, or `None` when no
	/// daemon is listening.
	pub async fn request(&self, request: &ControlRequest) -> Result<Option<ControlResponse>> {
		self.exchange(request, |_| {}).await
	}

	/// Like [`request`](Self::request), passing streamed events to `on_event`
	/// before returning the final response.
	pub async fn exchange(&self, request: &ControlRequest, on_event: impl FnMut(&SessionEvent)) -> Result<Option<ControlResponse>> {
		let stream = match self.connect().await {
			Ok(stream) => stream,
			Err(err) if is_not_running(&err) => return Ok(None),
			Err(err) => return Err(CliError::Io(err)),
		};
		exchange_stream(stream, request, on_event).await.map(Some)
	}

	#[cfg(unix)]
	async fn connect(&self) -> std::io::Result<UnixStream> {
		UnixStream::connect(&self.socket_path).await
	}

	#[cfg(not(unix))]
	async fn connect(&self) -> std::io::Result<TcpStream> {
		TcpStream::connect(("127.0.0.1", DAEMON_TCP_PORT)).await
	}
}

fn is_not_running(err: &std::io::Error) -> bool {
	matches!(err.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused)
}

async fn exchange_stream<S>(stream: S, request: &ControlRequest, mut on_event: impl FnMut(&SessionEvent)) -> Result<ControlResponse>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let (reader, mut writer) = tokio::io::split(stream);
	let payload = serde_json::to_string(request).context("Failed to serialize daemon request")?;
	writer
		.write_all(format!("{payload}\n").as_bytes())
		.await
		.context("Failed writing daemon request")?;
	writer.flush().await.context("Failed flushing daemon request")?;

	let mut lines = BufReader::new(reader).lines();
	while let Some(line) = lines.next_line().await.context("Failed reading daemon response")? {
		let response: ControlResponse = serde_json::from_str(&line).context("Failed parsing daemon response")?;
		match response {
			ControlResponse::Event { event } => on_event(&event),
			other => return Ok(other),
		}
	}
	Err(CliError::Daemon("connection closed before a response arrived".to_string()))
}
