use lock_wire::{Fault, FaultKind};
use thiserror::Error;

/// Errors surfaced by the client API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
	#[error("locking timeout elapsed before the lock was granted")]
	LockingTimeout,

	#[error("connection lost while the call was pending")]
	ConnectionLost,

	#[error("unknown lock id")]
	UnknownLock,

	#[error("lock is owned by another connection")]
	NotOwner,

	#[error("invalid request: {0}")]
	InvalidRequest(String),

	/// A fault whose name is not one of the canonical ones.
	#[error("server fault {name}: {message}")]
	Server { name: String, message: String },

	#[error("could not reach the server: {0}")]
	Connect(String),

	#[error("client is closed")]
	Closed,
}

impl From<Fault> for ClientError {
	fn from(fault: Fault) -> Self {
		match fault.kind() {
			Some(FaultKind::LockingTimeout) => Self::LockingTimeout,
			Some(FaultKind::UnknownLock) => Self::UnknownLock,
			Some(FaultKind::NotOwner) => Self::NotOwner,
			Some(FaultKind::InvalidRequest) => Self::InvalidRequest(fault.message),
			None => Self::Server {
				name: fault.name,
				message: fault.message,
			},
		}
	}
}

impl ClientError {
	/// Canonical name used in log event payloads.
	#[must_use]
	pub fn name(&self) -> &str {
		match self {
			Self::LockingTimeout => "LockingTimeout",
			Self::ConnectionLost => "ConnectionLost",
			Self::UnknownLock => "UnknownLock",
			Self::NotOwner => "NotOwner",
			Self::InvalidRequest(_) => "InvalidRequest",
			Self::Server { name, .. } => name,
			Self::Connect(_) => "ConnectError",
			Self::Closed => "Closed",
		}
	}
}
