//! Account identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum accepted identifier length.
pub const ACCOUNT_ID_MAX_LEN: usize = 64;

/// Opaque identifier of one externally addressable account (e.g. a phone number).
///
/// Identifiers double as the name of the account's credential directory, so
/// construction rejects anything that is not a plain path component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

/// Reason an identifier was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidAccountId {
	pub value: String,
	pub reason: &'static str,
}

impl fmt::Display for InvalidAccountId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "invalid account id {:?}: {}", self.value, self.reason)
	}
}

impl std::error::Error for InvalidAccountId {}

impl AccountId {
	/// Validates and wraps an identifier.
	pub fn new(value: impl Into<String>) -> Result<Self, InvalidAccountId> {
		let value = value.into();
		let reject = |reason| Err(InvalidAccountId { value: value.clone(), reason });

		if value.is_empty() {
			return reject("must not be empty");
		}
		if value.len() > ACCOUNT_ID_MAX_LEN {
			return reject("longer than 64 characters");
		}
		if value.starts_with('.') {
			return reject("must not start with '.'");
		}
		if !value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '+' | '-')) {
			return reject("only ASCII letters, digits, '_', '.', '+' and '-' are allowed");
		}

		Ok(Self(value))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for AccountId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl AsRef<str> for AccountId {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

impl TryFrom<String> for AccountId {
	type Error = InvalidAccountId;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

impl TryFrom<&str> for AccountId {
	type Error = InvalidAccountId;

	fn try_from(value: &str) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

impl std::str::FromStr for AccountId {
	type Err = InvalidAccountId;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::new(s)
	}
}

impl From<AccountId> for String {
	fn from(id: AccountId) -> Self {
		id.0
	}
}
