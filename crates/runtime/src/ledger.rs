//! Durable ordered record of accounts to reconnect on restart.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tether_protocol::AccountId;
use tracing::{debug, warn};

use crate::error::{Error, Result, StorageFault};
use crate::fsutil::{read_optional, write_atomic};

/// JSON array of account ids on disk. A missing file is an empty ledger.
#[derive(Debug)]
pub struct Ledger {
	path: PathBuf,
	// Serializes read-modify-write cycles.
	write_lock: Mutex<()>,
}

impl Ledger {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			write_lock: Mutex::new(()),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Reads the ledger in insertion order, dropping duplicates and invalid entries.
	pub fn load(&self) -> Result<Vec<AccountId>> {
		let Some(bytes) = read_optional(&self.path).map_err(|e| Error::storage(None, e))? else {
			return Ok(Vec::new());
		};
		let raw: Vec<String> = serde_json::from_slice(&bytes).map_err(|source| {
			Error::storage(
				None,
				StorageFault::Json {
					path: self.path.clone(),
					source,
				},
			)
		})?;

		let mut accounts: Vec<AccountId> = Vec::with_capacity(raw.len());
		for entry in raw {
			match AccountId::new(entry) {
				Ok(id) if !accounts.contains(&id) => accounts.push(id),
				Ok(id) => debug!(target = "tether.ledger", account = %id, "dropping duplicate ledger entry"),
				Err(err) => warn!(target = "tether.ledger", error = %err, "dropping invalid ledger entry"),
			}
		}
		Ok(accounts)
	}

	pub fn contains(&self, account: &AccountId) -> Result<bool> {
		Ok(self.load()?.contains(account))
	}

	/// Appends `account` if absent. Returns `true` when the ledger changed.
	pub fn insert(&self, account: &AccountId) -> Result<bool> {
		let _guard = self.write_lock.lock();
		let mut accounts = self.load()?;
		if accounts.contains(account) {
			return Ok(false);
		}
		accounts.push(account.clone());
		self.store(&accounts)?;
		debug!(target = "tether.ledger", %account, "account recorded");
		Ok(true)
	}

	/// Removes `account`. Returns `true` when the ledger changed.
	pub fn remove(&self, account: &AccountId) -> Result<bool> {
		let _guard = self.write_lock.lock();
		let mut accounts = self.load()?;
		let before = accounts.len();
		accounts.retain(|a| a != account);
		if accounts.len() == before {
			return Ok(false);
		}
		self.store(&accounts)?;
		debug!(target = "tether.ledger", %account, "account forgotten");
		Ok(true)
	}

	fn store(&self, accounts: &[AccountId]) -> Result<()> {
		let bytes = serde_json::to_vec(accounts).map_err(|source| {
			Error::storage(
				None,
				StorageFault::Json {
					path: self.path.clone(),
					source,
				},
			)
		})?;
		write_atomic(&self.path, &bytes).map_err(|e| Error::storage(None, e))
	}
}
