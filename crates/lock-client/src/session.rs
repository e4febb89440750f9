//! The reconnecting session.
//!
//! One task owns the "current connection" watch channel. Callers await
//! whatever connection is established next; they never re-register after a
//! disconnect. The task reconnects on an exponential backoff schedule and
//! narrates its life on the broadcast event stream.

use std::sync::Arc;
use std::time::Duration;

use lock_wire::Request;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ClientConfig, ReconnectConfig};
use crate::connection::Connection;
use crate::error::ClientError;
use crate::events::{ErrorInfo, LogEvent, SessionEvent};

const EVENT_BUFFER: usize = 64;

pub(crate) struct Session {
	current: watch::Receiver<Option<Arc<Connection>>>,
	events: broadcast::Sender<SessionEvent>,
	shutdown: CancellationToken,
}

impl Session {
	pub(crate) fn spawn(config: ClientConfig) -> Arc<Self> {
		let (current_tx, current) = watch::channel(None);
		let (events, _) = broadcast::channel(EVENT_BUFFER);
		let shutdown = CancellationToken::new();
		tokio::spawn(run(config, current_tx, events.clone(), shutdown.clone()));
		Arc::new(Self { current, events, shutdown })
	}

	pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
		self.events.subscribe()
	}

	pub(crate) fn emit(&self, event: SessionEvent) {
		let _ = self.events.send(event);
	}

	/// Resolves to the live connection, waiting out reconnects.
	pub(crate) async fn connection(&self) -> Result<Arc<Connection>, ClientError> {
		let mut current = self.current.clone();
		loop {
			if self.shutdown.is_cancelled() {
				return Err(ClientError::Closed);
			}
			let live = current.borrow_and_update().clone();
			if let Some(connection) = live {
				if !connection.is_closed() {
					return Ok(connection);
				}
			}
			if current.changed().await.is_err() {
				return Err(ClientError::Closed);
			}
		}
	}

	pub(crate) async fn lock(&self, resources: &[String], ttl: Duration, locking_timeout: Duration) -> Result<String, ClientError> {
		let params = lock_wire::LockParams {
			ttl: ttl.as_secs_f64(),
			locking_timeout: locking_timeout.as_secs_f64(),
		};
		let connection = self.connection().await?;
		match connection.call(|id| Request::lock(id, resources, params)).await? {
			Value::String(lock_id) => Ok(lock_id),
			other => Err(ClientError::Server {
				name: "UnexpectedResult".to_string(),
				message: format!("lock result was {other}"),
			}),
		}
	}

	pub(crate) async fn extend_lock(&self, lock_id: &str, ttl: Option<Duration>) -> Result<(), ClientError> {
		let connection = self.connection().await?;
		let ttl = ttl.map(|ttl| ttl.as_secs_f64());
		connection.call(|id| Request::extend_lock(id, lock_id, ttl)).await.map(|_| ())
	}

	pub(crate) async fn release_lock(&self, lock_id: &str) -> Result<(), ClientError> {
		let connection = self.connection().await?;
		connection.call(|id| Request::release_lock(id, lock_id)).await.map(|_| ())
	}

	/// Stops reconnecting and tears down the live connection.
	pub(crate) fn close(&self) {
		self.shutdown.cancel();
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

async fn run(config: ClientConfig, current: watch::Sender<Option<Arc<Connection>>>, events: broadcast::Sender<SessionEvent>, shutdown: CancellationToken) {
	let addr = config.addr();
	let mut backoff = Backoff::new(config.reconnect.normalized());
	let mut first_attempt = true;

	loop {
		if shutdown.is_cancelled() {
			break;
		}
		if first_attempt {
			// Startup connects immediately; only retries are delayed.
			first_attempt = false;
		} else {
			let delay = backoff.next_delay();
			let _ = events.send(SessionEvent::Log(LogEvent::ConnectDelay { delay: delay.as_secs_f64() }));
			debug!(?delay, "waiting before reconnect");
			tokio::select! {
				() = tokio::time::sleep(delay) => {}
				() = shutdown.cancelled() => break,
			}
		}

		match Connection::open(&addr, events.clone()).await {
			Ok(connection) => {
				backoff.reset();
				info!(%addr, "connected to lock server");
				let _ = events.send(SessionEvent::Connected);
				let _ = events.send(SessionEvent::Log(LogEvent::Connected));
				let closed = connection.closed_token();
				if current.send(Some(connection)).is_err() {
					closed.cancel();
					break;
				}
				tokio::select! {
					() = closed.cancelled() => {
						info!(%addr, "disconnected from lock server");
						let _ = events.send(SessionEvent::Disconnected);
						let _ = events.send(SessionEvent::Log(LogEvent::Disconnected));
						let _ = current.send(None);
					}
					() = shutdown.cancelled() => {
						closed.cancel();
						let _ = current.send(None);
						break;
					}
				}
			}
			Err(error) => {
				debug!(%addr, %error, "connect attempt failed");
				let _ = events.send(SessionEvent::Log(LogEvent::ConnectError { error: ErrorInfo::from(&error) }));
			}
		}
	}
	debug!("session task stopped");
}

/// Reconnect schedule: the first retry waits the initial interval, every
/// later one multiplies it, capped at the maximum.
struct Backoff {
	config: ReconnectConfig,
	interval: Option<Duration>,
}

impl Backoff {
	fn new(config: ReconnectConfig) -> Self {
		Self { config, interval: None }
	}

	/// Returns the delay to apply now and advances the schedule.
	fn next_delay(&mut self) -> Duration {
		let current = self.interval.unwrap_or(self.config.initial_interval);
		let advanced = current.max(self.config.initial_interval).mul_f64(self.config.interval_multiplier);
		self.interval = Some(advanced.min(self.config.max_interval));
		current
	}

	fn reset(&mut self) {
		self.interval = None;
	}
}
