//! Background task that keeps a lock alive while a handler runs.
//!
//! Cooperatively cancellable: the flag is checked before and after every
//! sleep, so cancellation never produces a trailing extend. Extend failures
//! are logged and stop the task; the handler keeps running and must tolerate
//! losing the lock.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ExtendDecision, ExtendPolicy};
use crate::events::{ErrorInfo, LogEvent, SessionEvent};
use crate::session::Session;

pub(crate) async fn run(session: Arc<Session>, lock_id: String, ttl: Duration, schedule: f64, policy: ExtendPolicy, cancel: CancellationToken) {
	let wake = ttl.mul_f64(schedule);
	let mut attempt: u32 = 0;
	loop {
		if cancel.is_cancelled() {
			return;
		}
		tokio::select! {
			() = cancel.cancelled() => return,
			() = tokio::time::sleep(wake) => {}
		}
		if cancel.is_cancelled() {
			return;
		}

		let ttl_override = match policy.decide(attempt) {
			ExtendDecision::Stop => {
				debug!(lock = %lock_id, attempt, "auto-extend finished");
				return;
			}
			ExtendDecision::Extend => None,
			ExtendDecision::ExtendFor(ttl) => Some(ttl),
		};
		attempt += 1;

		if let Err(error) = session.extend_lock(&lock_id, ttl_override).await {
			warn!(lock = %lock_id, %error, "auto-extend failed");
			session.emit(SessionEvent::Log(LogEvent::ExtendLockError {
				lock_id: lock_id.clone(),
				error: ErrorInfo::from(&error),
			}));
			return;
		}
		debug!(lock = %lock_id, attempt, "lock extended");
	}
}
