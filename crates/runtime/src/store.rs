//! Per-account durable credential storage.
//!
//! Layout: `<root>/<account>/creds.json`. Each account owns its directory, so
//! corrupting or erasing one account never touches another. Operations on the
//! same account are serialized through a per-account lock; different accounts
//! never contend.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_protocol::AccountId;
use tracing::{debug, info};

use crate::error::{Error, Result, StorageFault};
use crate::fsutil::{read_optional, write_atomic};

const CREDS_FILE: &str = "creds.json";

/// Opaque authentication state issued by the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(pub Value);

impl Credentials {
	pub fn new(value: Value) -> Self {
		Self(value)
	}

	pub fn as_value(&self) -> &Value {
		&self.0
	}
}

#[derive(Debug)]
pub struct CredentialStore {
	root: PathBuf,
	locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl CredentialStore {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self {
			root: root.into(),
			locks: Mutex::new(HashMap::new()),
		}
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	/// Directory holding everything persisted for `account`.
	pub fn account_dir(&self, account: &AccountId) -> PathBuf {
		self.root.join(account.as_str())
	}

	fn creds_path(&self, account: &AccountId) -> PathBuf {
		self.account_dir(account).join(CREDS_FILE)
	}

	fn lock_for(&self, account: &AccountId) -> Arc<Mutex<()>> {
		Arc::clone(self.locks.lock().entry(account.clone()).or_default())
	}

	/// Loads stored credentials; `Ok(None)` when the account has none.
	///
	/// A file that exists but does not parse is an error, not "absent":
	/// treating it as absent would silently force a re-pairing.
	pub fn load(&self, account: &AccountId) -> Result<Option<Credentials>> {
		let lock = self.lock_for(account);
		let _guard = lock.lock();

		let path = self.creds_path(account);
		let Some(bytes) = read_optional(&path).map_err(|e| Error::storage(Some(account), e))? else {
			return Ok(None);
		};
		let value = serde_json::from_slice(&bytes).map_err(|source| Error::storage(Some(account), StorageFault::Json { path, source }))?;
		Ok(Some(Credentials(value)))
	}

	pub fn save(&self, account: &AccountId, credentials: &Credentials) -> Result<()> {
		let lock = self.lock_for(account);
		let _guard = lock.lock();

		let path = self.creds_path(account);
		let bytes = serde_json::to_vec_pretty(credentials).map_err(|source| Error::storage(Some(account), StorageFault::Json { path: path.clone(), source }))?;
		write_atomic(&path, &bytes).map_err(|e| Error::storage(Some(account), e))?;
		debug!(target = "tether.store", %account, "credentials saved");
		Ok(())
	}

	/// Irreversibly removes the account's directory. Returns `false` when
	/// there was nothing to remove.
	pub fn erase(&self, account: &AccountId) -> Result<bool> {
		let lock = self.lock_for(account);
		let guard = lock.lock();

		let dir = self.account_dir(account);
		let erased = match fs::remove_dir_all(&dir) {
			Ok(()) => {
				info!(target = "tether.store", %account, "credentials erased");
				true
			}
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
			Err(err) => return Err(Error::storage(Some(account), StorageFault::io("remove", dir, err))),
		};

		drop(guard);
		self.forget_lock(account, &lock);
		Ok(erased)
	}

	/// Drops the account's lock entry unless another operation still holds it.
	fn forget_lock(&self, account: &AccountId, lock: &Arc<Mutex<()>>) {
		let mut locks = self.locks.lock();
		// One reference in the map plus the caller's.
		if locks.get(account).is_some_and(|held| Arc::ptr_eq(held, lock) && Arc::strong_count(held) == 2) {
			locks.remove(account);
		}
	}

	#[cfg(test)]
	fn tracked_locks(&self) -> usize {
		self.locks.lock().len()
	}

	pub fn exists(&self, account: &AccountId) -> bool {
		self.creds_path(account).is_file()
	}
}
