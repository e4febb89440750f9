use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{ClientConfig, LockOptions};
use crate::error::ClientError;
use crate::events::{ErrorInfo, LogEvent, SessionEvent};
use crate::extender;
use crate::session::Session;

/// One or many resource ids. A single id becomes a one-element set.
#[derive(Debug, Clone)]
pub struct Resources(Vec<String>);

impl Resources {
	fn into_vec(self) -> Vec<String> {
		self.0
	}
}

impl From<&str> for Resources {
	fn from(resource: &str) -> Self {
		Self(vec![resource.to_string()])
	}
}

impl From<String> for Resources {
	fn from(resource: String) -> Self {
		Self(vec![resource])
	}
}

impl From<Vec<String>> for Resources {
	fn from(resources: Vec<String>) -> Self {
		Self(resources)
	}
}

impl<const N: usize> From<[&str; N]> for Resources {
	fn from(resources: [&str; N]) -> Self {
		Self(resources.iter().map(ToString::to_string).collect())
	}
}

impl From<&[&str]> for Resources {
	fn from(resources: &[&str]) -> Self {
		Self(resources.iter().map(ToString::to_string).collect())
	}
}

/// Handle given to `with_lock` handlers for manual extension.
#[derive(Clone)]
pub struct LockHandle {
	session: Arc<Session>,
	lock_id: String,
}

impl LockHandle {
	#[must_use]
	pub fn lock_id(&self) -> &str {
		&self.lock_id
	}

	/// Resets the lock's deadline to `now + ttl`; the acquire-time TTL
	/// applies when `ttl` is `None`.
	pub async fn extend(&self, ttl: Option<Duration>) -> Result<(), ClientError> {
		self.session.extend_lock(&self.lock_id, ttl).await
	}
}

/// Client of the ordered lock service.
///
/// Connects lazily and keeps reconnecting until [`LockClient::close`] is
/// called or the client is dropped. All lock calls wait for the current
/// connection, so a call issued during a reconnect simply resumes once the
/// session is back.
pub struct LockClient {
	session: Arc<Session>,
}

impl LockClient {
	#[must_use]
	pub fn connect(config: ClientConfig) -> Self {
		Self { session: Session::spawn(config) }
	}

	/// Subscribes to lifecycle and log events.
	#[must_use]
	pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
		self.session.subscribe()
	}

	/// Acquires a lock on the named resources, queuing at most
	/// `locking_timeout` behind earlier requests.
	pub async fn lock(&self, resources: impl Into<Resources>, options: &LockOptions) -> Result<String, ClientError> {
		let resources = resources.into().into_vec();
		self.session.lock(&resources, options.ttl, options.locking_timeout).await
	}

	/// Acquires, runs `handler`, then releases.
	///
	/// With an extend policy configured, a background extender keeps the
	/// lock alive for the handler's lifetime. Release failures are reported
	/// on the event stream only; the handler's result is the outcome that
	/// matters and the server reclaims the lock at its TTL regardless.
	pub async fn with_lock<R, F, Fut, T>(&self, resources: R, options: &LockOptions, handler: F) -> Result<T, ClientError>
	where
		R: Into<Resources>,
		F: FnOnce(LockHandle) -> Fut,
		Fut: Future<Output = T>,
	{
		if options.extends.is_some() && !(options.extend_schedule > 0.0 && options.extend_schedule < 1.0) {
			return Err(ClientError::InvalidRequest("extend schedule must be a fraction between 0 and 1".to_string()));
		}

		let lock_id = self.lock(resources, options).await?;
		let cancel = CancellationToken::new();
		let extender = options.extends.clone().map(|policy| {
			tokio::spawn(extender::run(
				self.session.clone(),
				lock_id.clone(),
				options.ttl,
				options.extend_schedule,
				policy,
				cancel.clone(),
			))
		});

		let handle = LockHandle {
			session: self.session.clone(),
			lock_id: lock_id.clone(),
		};
		let result = handler(handle).await;

		cancel.cancel();
		if let Some(extender) = extender {
			let _ = extender.await;
		}
		if let Err(error) = self.session.release_lock(&lock_id).await {
			warn!(lock = %lock_id, %error, "release after handler failed");
			self.session.emit(SessionEvent::Log(LogEvent::ReleaseLockError {
				lock_id,
				error: ErrorInfo::from(&error),
			}));
		}
		Ok(result)
	}

	/// Resets a held lock's deadline; see [`LockHandle::extend`].
	pub async fn extend_lock(&self, lock_id: &str, ttl: Option<Duration>) -> Result<(), ClientError> {
		self.session.extend_lock(lock_id, ttl).await
	}

	/// Releases a held lock.
	pub async fn release_lock(&self, lock_id: &str) -> Result<(), ClientError> {
		self.session.release_lock(lock_id).await
	}

	/// Stops the session and drops the live connection. In-flight calls
	/// fail; the client cannot be reused afterwards.
	pub fn close(&self) {
		self.session.close();
	}
}
