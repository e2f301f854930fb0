//! WebSocket connector speaking the gateway's JSON frame protocol.
//!
//! # Frames
//!
//! Every frame is a JSON text message tagged by `type`.
//!
//! Client to gateway:
//! ```json
//! {"type":"hello","account":"1000","credentials":null}
//! {"type":"pairing_request"}
//! {"type":"message","payload":{...}}
//! ```
//!
//! Gateway to client:
//! ```json
//! {"type":"open"}
//! {"type":"pairing_code","code":"ABCDEFGH"}
//! {"type":"pairing_error","message":"number not registered"}
//! {"type":"paired"}
//! {"type":"credentials","credentials":{...}}
//! {"type":"close","code":503,"reason":"restarting"}
//! ```
//!
//! A WebSocket close frame without a preceding `close` frame reports its own
//! numeric close code.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_protocol::AccountId;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use super::{BoxFuture, Connector, Link, LinkEvent, SessionHandle};
use crate::error::{Error, Result};
use crate::store::Credentials;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame<'a> {
	Hello {
		account: &'a AccountId,
		credentials: Option<&'a Credentials>,
	},
	PairingRequest,
	Message {
		payload: Value,
	},
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
	Open,
	Paired,
	PairingCode {
		code: String,
	},
	PairingError {
		message: String,
	},
	Credentials {
		credentials: Credentials,
	},
	Close {
		#[serde(default)]
		code: Option<u16>,
		#[serde(default)]
		reason: Option<String>,
	},
}

type PendingPairing = Arc<Mutex<Option<oneshot::Sender<Result<String>>>>>;

/// Opens one WebSocket per account against a fixed gateway URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
	url: String,
}

impl WsConnector {
	pub fn new(url: impl Into<String>) -> Self {
		Self { url: url.into() }
	}

	pub fn url(&self) -> &str {
		&self.url
	}
}

impl Connector for WsConnector {
	fn open<'a>(&'a self, account: &'a AccountId, credentials: Option<Credentials>) -> BoxFuture<'a, Result<Link>> {
		Box::pin(async move {
			let (socket, _response) = tokio_tungstenite::connect_async(self.url.as_str())
				.await
				.map_err(|e| Error::Transport(format!("connect {}: {e}", self.url)))?;
			debug!(target = "tether.ws", %account, url = %self.url, "socket opened");

			let (mut sink, mut stream) = socket.split();

			let hello = encode(&ClientFrame::Hello {
				account,
				credentials: credentials.as_ref(),
			})?;
			sink.send(hello).await.map_err(|e| Error::Transport(format!("hello: {e}")))?;

			let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
			let (event_tx, event_rx) = mpsc::unbounded_channel();
			let pending: PendingPairing = Arc::new(Mutex::new(None));
			let closed = Arc::new(AtomicBool::new(false));

			tokio::spawn(async move {
				while let Some(message) = out_rx.recv().await {
					let is_close = matches!(message, Message::Close(_));
					if let Err(err) = sink.send(message).await {
						debug!(target = "tether.ws", error = %err, "writer stopped");
						break;
					}
					if is_close {
						break;
					}
				}
			});

			let reader_pending = Arc::clone(&pending);
			let reader_account = account.clone();
			tokio::spawn(async move {
				let mut close_reported = false;
				while let Some(message) = stream.next().await {
					let message = match message {
						Ok(message) => message,
						Err(err) => {
							debug!(target = "tether.ws", account = %reader_account, error = %err, "read failed");
							break;
						}
					};
					match message {
						Message::Text(text) => {
							trace!(target = "tether.ws", account = %reader_account, frame = %text, "frame");
							let frame = match serde_json::from_str::<ServerFrame>(&text) {
								Ok(frame) => frame,
								Err(err) => {
									warn!(target = "tether.ws", account = %reader_account, error = %err, "ignoring malformed frame");
									continue;
								}
							};
							if let Some(event) = dispatch(frame, &reader_pending) {
								close_reported |= matches!(event, LinkEvent::Closed { .. });
								if event_tx.send(event).is_err() {
									break;
								}
							}
						}
						Message::Close(frame) => {
							if !close_reported {
								let (code, reason) = match frame {
									Some(frame) => (Some(u16::from(frame.code)), Some(frame.reason.to_string()).filter(|r| !r.is_empty())),
									None => (None, None),
								};
								let _ = event_tx.send(LinkEvent::Closed { code, reason });
								close_reported = true;
							}
							break;
						}
						_ => {}
					}
				}

				if let Some(waiter) = reader_pending.lock().take() {
					let _ = waiter.send(Err(Error::Transport("connection closed before a pairing code arrived".to_string())));
				}
				if !close_reported {
					let _ = event_tx.send(LinkEvent::Closed {
						code: None,
						reason: Some("stream ended".to_string()),
					});
				}
			});

			let handle = WsHandle {
				out: out_tx,
				pending,
				closed,
			};
			Ok(Link {
				handle: Arc::new(handle),
				events: event_rx,
			})
		})
	}
}

fn dispatch(frame: ServerFrame, pending: &PendingPairing) -> Option<LinkEvent> {
	match frame {
		ServerFrame::Open => Some(LinkEvent::Open),
		ServerFrame::Paired => Some(LinkEvent::Paired),
		ServerFrame::Credentials { credentials } => Some(LinkEvent::CredentialsUpdated(credentials)),
		ServerFrame::Close { code, reason } => Some(LinkEvent::Closed { code, reason }),
		ServerFrame::PairingCode { code } => {
			if let Some(waiter) = pending.lock().take() {
				let _ = waiter.send(Ok(code));
			}
			None
		}
		ServerFrame::PairingError { message } => {
			if let Some(waiter) = pending.lock().take() {
				let _ = waiter.send(Err(Error::Transport(message)));
			}
			None
		}
	}
}

fn encode(frame: &ClientFrame<'_>) -> Result<Message> {
	let text = serde_json::to_string(frame).map_err(|e| Error::Transport(format!("encode frame: {e}")))?;
	Ok(Message::Text(text))
}

struct WsHandle {
	out: mpsc::UnboundedSender<Message>,
	pending: PendingPairing,
	closed: Arc<AtomicBool>,
}

impl WsHandle {
	fn push(&self, message: Message) -> Result<()> {
		if self.is_closed() {
			return Err(Error::Transport("connection closed".to_string()));
		}
		self.out.send(message).map_err(|_| Error::Transport("connection closed".to_string()))
	}
}

impl SessionHandle for WsHandle {
	fn send(&self, payload: Value) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move { self.push(encode(&ClientFrame::Message { payload })?) })
	}

	fn request_pairing_code(&self) -> BoxFuture<'_, Result<String>> {
		Box::pin(async move {
			let (tx, rx) = oneshot::channel();
			if self.pending.lock().replace(tx).is_some() {
				debug!(target = "tether.ws", "superseding an unanswered pairing request");
			}
			self.push(encode(&ClientFrame::PairingRequest)?)?;
			rx.await.map_err(|_| Error::ChannelClosed)?
		})
	}

	fn close(&self) -> BoxFuture<'_, ()> {
		Box::pin(async move {
			if !self.closed.swap(true, Ordering::SeqCst) {
				let _ = self.out.send(Message::Close(None));
			}
		})
	}

	fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}
}
