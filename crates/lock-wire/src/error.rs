use thiserror::Error;

/// Errors raised while encoding or decoding wire frames.
#[derive(Debug, Error)]
pub enum WireError {
	#[error("i/o failure on the wire: {0}")]
	Io(#[from] std::io::Error),

	#[error("malformed json frame: {0}")]
	Json(#[from] serde_json::Error),
}

/// Result type for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;
