//! One task per client connection.
//!
//! The read loop decodes framed requests and spawns a dispatch task per
//! call, so slow acquisitions never block later requests on the same
//! connection; completions interleave and the request id correlates them.
//! When the socket goes away the connection drains its locks through the
//! manager before the task exits.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lock_core::{AcquireError, LockManager, LockOpError, OwnerId};
use lock_wire::{Call, Fault, FaultKind, Request, RequestId, Response, ServerCodec};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct Connection {
	owner: OwnerId,
	manager: LockManager,
	shutdown: CancellationToken,
}

impl Connection {
	pub(crate) fn new(manager: LockManager, shutdown: CancellationToken) -> Self {
		Self {
			owner: OwnerId::new(),
			manager,
			shutdown,
		}
	}

	pub(crate) async fn run(self, socket: TcpStream, peer: SocketAddr) {
		info!(%peer, owner = %self.owner, "client connected");

		let (read_half, write_half) = socket.into_split();
		let mut requests = FramedRead::new(read_half, ServerCodec::new());
		let mut sink = FramedWrite::new(write_half, ServerCodec::new());

		let (responses, mut response_rx) = mpsc::unbounded_channel::<Response>();
		let writer = tokio::spawn(async move {
			while let Some(response) = response_rx.recv().await {
				if let Err(error) = sink.send(response).await {
					debug!(%error, "response write failed");
					break;
				}
			}
		});

		loop {
			tokio::select! {
				frame = requests.next() => match frame {
					Some(Ok(request)) => self.dispatch(request, &responses),
					Some(Err(error)) => {
						warn!(%peer, %error, "dropping connection on bad frame");
						break;
					}
					None => break,
				},
				() = self.shutdown.cancelled() => break,
			}
		}

		// Reclaim everything this connection owned before the task exits;
		// waiters on other connections are promoted without any TTL wait.
		self.manager.owner_closed(self.owner).await;
		drop(responses);
		let _ = writer.await;
		info!(%peer, owner = %self.owner, "client disconnected");
	}

	fn dispatch(&self, request: Request, responses: &mpsc::UnboundedSender<Response>) {
		let id = request.id.clone();
		let call = match request.call() {
			Ok(call) => call,
			Err(fault) => {
				let _ = responses.send(Response::fail(id, fault));
				return;
			}
		};
		debug!(owner = %self.owner, ?call, "dispatching call");
		let manager = self.manager.clone();
		let owner = self.owner;
		let responses = responses.clone();
		tokio::spawn(async move {
			if let Some(response) = execute(&manager, owner, id, call).await {
				let _ = responses.send(response);
			}
		});
	}
}

async fn execute(manager: &LockManager, owner: OwnerId, id: RequestId, call: Call) -> Option<Response> {
	match call {
		Call::Lock { resources, params } => {
			let Some(ttl) = positive_duration(params.ttl) else {
				return Some(Response::fail(id, Fault::invalid_request("ttl must be a positive number of seconds")));
			};
			let Some(locking_timeout) = non_negative_duration(params.locking_timeout) else {
				return Some(Response::fail(id, Fault::invalid_request("lockingTimeout must be a non-negative number of seconds")));
			};
			match manager.acquire(owner, resources, ttl, locking_timeout).await {
				Ok(lock_id) => Some(Response::ok(id, Value::String(lock_id.to_string()))),
				Err(AcquireError::Timeout) => Some(Response::fail(id, Fault::new(FaultKind::LockingTimeout, "locking timeout elapsed"))),
				Err(AcquireError::Invalid(reason)) => Some(Response::fail(id, Fault::invalid_request(reason))),
				// The connection is gone or the server is stopping; there is
				// nobody to answer.
				Err(AcquireError::Cancelled | AcquireError::Closed) => None,
			}
		}
		Call::ExtendLock { lock_id, ttl } => {
			let ttl = match ttl {
				None => None,
				Some(seconds) => match positive_duration(seconds) {
					Some(ttl) => Some(ttl),
					None => return Some(Response::fail(id, Fault::invalid_request("ttl must be a positive number of seconds"))),
				},
			};
			Some(lock_op_response(id, &lock_id, manager.extend(owner, lock_id.as_str().into(), ttl).await))
		}
		Call::ReleaseLock { lock_id } => Some(lock_op_response(id, &lock_id, manager.release(owner, lock_id.as_str().into()).await)),
	}
}

fn lock_op_response(id: RequestId, lock_id: &str, outcome: Result<(), LockOpError>) -> Response {
	match outcome {
		Ok(()) => Response::ok(id, Value::Null),
		Err(LockOpError::UnknownLock | LockOpError::Closed) => Response::fail(id, Fault::new(FaultKind::UnknownLock, format!("no lock with id `{lock_id}`"))),
		Err(LockOpError::NotOwner) => Response::fail(id, Fault::new(FaultKind::NotOwner, format!("lock `{lock_id}` is owned by another connection"))),
	}
}

fn positive_duration(seconds: f64) -> Option<Duration> {
	if seconds > 0.0 {
		Duration::try_from_secs_f64(seconds).ok()
	} else {
		None
	}
}

fn non_negative_duration(seconds: f64) -> Option<Duration> {
	if seconds >= 0.0 {
		Duration::try_from_secs_f64(seconds).ok()
	} else {
		None
	}
}
