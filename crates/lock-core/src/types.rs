use std::fmt;

use uuid::Uuid;

/// Identifier handed to a client when a lock is granted.
///
/// Opaque and never reused within a server lifetime. Clients echo it back
/// verbatim on extend and release, so it stays a plain string here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(String);

impl LockId {
	pub(crate) fn generate() -> Self {
		Self(Uuid::new_v4().to_string())
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<&str> for LockId {
	fn from(id: &str) -> Self {
		Self(id.to_string())
	}
}

impl From<String> for LockId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

impl fmt::Display for LockId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Server-side identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(Uuid);

impl OwnerId {
	#[must_use]
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for OwnerId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for OwnerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}
