use serde::Serialize;

use crate::error::ClientError;

/// `{name, message}` payload embedded in error log events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
	pub name: String,
	pub message: String,
}

impl From<&ClientError> for ErrorInfo {
	fn from(error: &ClientError) -> Self {
		Self {
			name: error.name().to_string(),
			message: error.to_string(),
		}
	}
}

/// Structured log entries on the session's event stream.
///
/// Serializes as `{"type": ..., "data": ...}` with kebab-case type names,
/// so embedders can forward entries to their own sinks verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum LogEvent {
	ConnectDelay { delay: f64 },
	ConnectError { error: ErrorInfo },
	ConnectionError { error: ErrorInfo },
	Connected,
	Disconnected,
	#[serde(rename_all = "camelCase")]
	ExtendLockError { lock_id: String, error: ErrorInfo },
	#[serde(rename_all = "camelCase")]
	ReleaseLockError { lock_id: String, error: ErrorInfo },
}

/// Lifecycle notifications for embedders.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
	Connected,
	Disconnected,
	Log(LogEvent),
}
