//! Wire protocol for the ordered lock service.
//!
//! Both peers exchange length-prefixed JSON frames over one TCP connection.
//! A frame carries either a [`Request`] (`{id, method, params}`) or a
//! [`Response`] (`{id, result}` on success, `{id, error}` on failure).
//! Responses are correlated to requests by `id`; in-flight requests on one
//! connection may complete in any order.

mod codec;
mod error;
mod message;

pub use codec::{ClientCodec, JsonCodec, ServerCodec, MAX_FRAME_LEN};
pub use error::{Result, WireError};
pub use message::{Call, Fault, FaultKind, LockParams, Request, RequestId, Response, METHOD_EXTEND_LOCK, METHOD_LOCK, METHOD_RELEASE_LOCK};

/// Default TCP port the lock server listens on.
pub const DEFAULT_PORT: u16 = 3292;
