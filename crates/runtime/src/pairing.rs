//! Pairing-code issuance for accounts without local credentials.

use std::time::Duration;

use tether_protocol::PairingAttempt;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::transport::SessionHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingConfig {
	/// Pause between opening the connection and asking for a code; the
	/// remote rejects requests made before its handshake settles.
	pub settle_delay: Duration,
	/// Upper bound on how long the remote may take to issue a code.
	pub request_timeout: Duration,
	/// Upper bound on how long an issued code may go unused.
	pub window: Duration,
}

impl Default for PairingConfig {
	fn default() -> Self {
		Self {
			settle_delay: Duration::from_secs(1),
			request_timeout: Duration::from_secs(30),
			window: Duration::from_secs(180),
		}
	}
}

/// Requests pairing codes. Never retries: a failure is reported once and the
/// operator decides whether to try again.
#[derive(Debug, Clone, Default)]
pub struct PairingCoordinator {
	config: PairingConfig,
}

impl PairingCoordinator {
	pub fn new(config: PairingConfig) -> Self {
		Self { config }
	}

	pub fn config(&self) -> &PairingConfig {
		&self.config
	}

	/// Asks the remote behind `handle` for a pairing code, recording the
	/// outcome on `attempt`.
	pub async fn request(&self, attempt: &mut PairingAttempt, handle: &dyn SessionHandle) -> Result<String> {
		tokio::time::sleep(self.config.settle_delay).await;

		let reason = match tokio::time::timeout(self.config.request_timeout, handle.request_pairing_code()).await {
			Ok(Ok(code)) if !code.trim().is_empty() => {
				let code = code.trim().to_string();
				attempt.issue(code.clone());
				info!(target = "tether.pairing", account = %attempt.account, "pairing code issued");
				return Ok(code);
			}
			Ok(Ok(_)) => "remote returned an empty pairing code".to_string(),
			Ok(Err(err)) => err.to_string(),
			Err(_) => Error::Timeout(format!("no pairing code within {}ms", self.config.request_timeout.as_millis())).to_string(),
		};

		warn!(target = "tether.pairing", account = %attempt.account, %reason, "pairing code request failed");
		attempt.fail(reason.clone());
		Err(Error::Pairing {
			account: attempt.account.clone(),
			reason,
		})
	}
}
