//! In-memory map of live connection handles.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tether_protocol::AccountId;

use crate::transport::SessionHandle;

/// Account id -> live handle, for accounts that are currently connected.
///
/// The registry never closes handles itself: `register` hands back the
/// superseded handle and `unregister` hands back the removed one, and the
/// caller decides what to do with them.
#[derive(Default)]
pub struct SessionRegistry {
	sessions: RwLock<HashMap<AccountId, Arc<dyn SessionHandle>>>,
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Stores `handle`, returning any handle previously registered for `account`.
	pub fn register(&self, account: AccountId, handle: Arc<dyn SessionHandle>) -> Option<Arc<dyn SessionHandle>> {
		self.sessions.write().insert(account, handle)
	}

	pub fn unregister(&self, account: &AccountId) -> Option<Arc<dyn SessionHandle>> {
		self.sessions.write().remove(account)
	}

	/// Removes the entry only if it still points at `handle`.
	pub fn unregister_if(&self, account: &AccountId, handle: &Arc<dyn SessionHandle>) -> bool {
		let mut sessions = self.sessions.write();
		match sessions.get(account) {
			Some(current) if Arc::ptr_eq(current, handle) => {
				sessions.remove(account);
				true
			}
			_ => false,
		}
	}

	pub fn get(&self, account: &AccountId) -> Option<Arc<dyn SessionHandle>> {
		self.sessions.read().get(account).cloned()
	}

	pub fn contains(&self, account: &AccountId) -> bool {
		self.sessions.read().contains_key(account)
	}

	pub fn account_ids(&self) -> BTreeSet<AccountId> {
		self.sessions.read().keys().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.sessions.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.read().is_empty()
	}
}

impl std::fmt::Debug for SessionRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionRegistry").field("accounts", &self.account_ids()).finish()
	}
}
