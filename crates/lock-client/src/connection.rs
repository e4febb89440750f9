//! One live connection to the server.
//!
//! Owns the socket and the pending-completion map. `call` assigns a fresh
//! correlation id, registers a oneshot completion, and writes the framed
//! request; a reader task resolves completions by id. When the socket goes
//! away, every pending call fails with `ConnectionLost` and the session is
//! notified through the cancellation token. Retrying is the session's
//! business, never this layer's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use lock_wire::{ClientCodec, Request, RequestId, Response};
use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::events::{ErrorInfo, LogEvent, SessionEvent};

type Completion = oneshot::Sender<Result<Value, ClientError>>;

#[derive(Default)]
struct Pending {
	completions: Mutex<HashMap<u64, Completion>>,
}

impl Pending {
	async fn insert(&self, id: u64, completion: Completion) {
		self.completions.lock().await.insert(id, completion);
	}

	async fn remove(&self, id: u64) {
		self.completions.lock().await.remove(&id);
	}

	async fn resolve(&self, response: Response) {
		let RequestId::Number(id) = response.id else {
			warn!("discarding response with non-numeric id");
			return;
		};
		let Some(completion) = self.completions.lock().await.remove(&id) else {
			debug!(id, "response for unknown call");
			return;
		};
		let result = match response.error {
			Some(fault) => Err(ClientError::from(fault)),
			None => Ok(response.result.unwrap_or(Value::Null)),
		};
		let _ = completion.send(result);
	}

	async fn fail_all(&self) {
		for (_, completion) in self.completions.lock().await.drain() {
			let _ = completion.send(Err(ClientError::ConnectionLost));
		}
	}
}

pub(crate) struct Connection {
	requests: mpsc::UnboundedSender<Request>,
	pending: Arc<Pending>,
	next_id: AtomicU64,
	closed: CancellationToken,
}

impl Connection {
	pub(crate) async fn open(addr: &str, events: broadcast::Sender<SessionEvent>) -> Result<Arc<Self>, ClientError> {
		let socket = TcpStream::connect(addr).await.map_err(|error| ClientError::Connect(error.to_string()))?;
		if let Err(error) = socket.set_nodelay(true) {
			debug!(%error, "failed to set nodelay");
		}
		let (read_half, write_half) = socket.into_split();

		let (requests, request_rx) = mpsc::unbounded_channel();
		let pending = Arc::new(Pending::default());
		let closed = CancellationToken::new();

		tokio::spawn(write_loop(
			FramedWrite::new(write_half, ClientCodec::new()),
			request_rx,
			closed.clone(),
			events.clone(),
		));
		tokio::spawn(read_loop(FramedRead::new(read_half, ClientCodec::new()), pending.clone(), closed.clone(), events));

		Ok(Arc::new(Self {
			requests,
			pending,
			next_id: AtomicU64::new(0),
			closed,
		}))
	}

	/// True once the socket is gone; further calls fail with `ConnectionLost`.
	pub(crate) fn is_closed(&self) -> bool {
		self.closed.is_cancelled()
	}

	/// Token that fires when the connection dies; cancelling it tears the
	/// connection down.
	pub(crate) fn closed_token(&self) -> CancellationToken {
		self.closed.clone()
	}

	/// Sends one request and awaits its correlated response.
	pub(crate) async fn call(&self, build: impl FnOnce(RequestId) -> Request) -> Result<Value, ClientError> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let (completion, response) = oneshot::channel();
		self.pending.insert(id, completion).await;

		if self.requests.send(build(RequestId::Number(id))).is_err() {
			self.pending.remove(id).await;
			return Err(ClientError::ConnectionLost);
		}

		tokio::select! {
			outcome = response => outcome.unwrap_or(Err(ClientError::ConnectionLost)),
			() = self.closed.cancelled() => Err(ClientError::ConnectionLost),
		}
	}
}

async fn write_loop(
	mut sink: FramedWrite<OwnedWriteHalf, ClientCodec>,
	mut requests: mpsc::UnboundedReceiver<Request>,
	closed: CancellationToken,
	events: broadcast::Sender<SessionEvent>,
) {
	loop {
		tokio::select! {
			request = requests.recv() => match request {
				Some(request) => {
					if let Err(error) = sink.send(request).await {
						debug!(%error, "request write failed");
						let info = ErrorInfo { name: "ConnectionError".to_string(), message: error.to_string() };
						let _ = events.send(SessionEvent::Log(LogEvent::ConnectionError { error: info }));
						closed.cancel();
						break;
					}
				}
				None => break,
			},
			() = closed.cancelled() => break,
		}
	}
}

async fn read_loop(mut frames: FramedRead<OwnedReadHalf, ClientCodec>, pending: Arc<Pending>, closed: CancellationToken, events: broadcast::Sender<SessionEvent>) {
	loop {
		tokio::select! {
			frame = frames.next() => match frame {
				Some(Ok(response)) => pending.resolve(response).await,
				Some(Err(error)) => {
					debug!(%error, "response read failed");
					let info = ErrorInfo { name: "ConnectionError".to_string(), message: error.to_string() };
					let _ = events.send(SessionEvent::Log(LogEvent::ConnectionError { error: info }));
					break;
				}
				None => break,
			},
			() = closed.cancelled() => break,
		}
	}
	closed.cancel();
	pending.fail_all().await;
}
