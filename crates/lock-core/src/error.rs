use thiserror::Error;

/// Why an acquisition did not produce a lock.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcquireError {
	#[error("locking timeout elapsed before the resources were free")]
	Timeout,

	#[error("acquisition cancelled because the owning connection closed")]
	Cancelled,

	#[error("invalid acquisition: {0}")]
	Invalid(String),

	#[error("lock manager is shut down")]
	Closed,
}

/// Why a release or extend was refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LockOpError {
	#[error("no such lock")]
	UnknownLock,

	#[error("lock is owned by another connection")]
	NotOwner,

	#[error("lock manager is shut down")]
	Closed,
}
