use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lock_wire::DEFAULT_PORT;

/// Where the client connects and how it reconnects.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	pub host: String,
	pub port: u16,
	pub reconnect: ReconnectConfig,
}

impl ClientConfig {
	#[must_use]
	pub fn new(host: impl Into<String>) -> Self {
		Self {
			host: host.into(),
			port: DEFAULT_PORT,
			reconnect: ReconnectConfig::default(),
		}
	}

	#[must_use]
	pub fn port(mut self, port: u16) -> Self {
		self.port = port;
		self
	}

	#[must_use]
	pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
		self.reconnect = reconnect;
		self
	}

	pub(crate) fn addr(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}
}

/// Exponential backoff schedule for reconnection attempts.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
	pub initial_interval: Duration,
	pub max_interval: Duration,
	pub interval_multiplier: f64,
}

impl Default for ReconnectConfig {
	fn default() -> Self {
		Self {
			initial_interval: Duration::from_secs(1),
			max_interval: Duration::from_secs(5),
			interval_multiplier: 1.5,
		}
	}
}

impl ReconnectConfig {
	/// A zero initial interval falls back to the default rather than
	/// producing a hot reconnect loop.
	pub(crate) fn normalized(mut self) -> Self {
		if self.initial_interval.is_zero() {
			self.initial_interval = Duration::from_secs(1);
		}
		self
	}
}

/// Per-acquisition options.
#[derive(Clone)]
pub struct LockOptions {
	/// How long the lock survives without an extension.
	pub ttl: Duration,
	/// How long an acquire may queue behind earlier requests.
	pub locking_timeout: Duration,
	/// Fraction of the TTL after which the auto-extender wakes.
	pub extend_schedule: f64,
	/// Auto-extend policy; `None` disables the extender.
	pub extends: Option<ExtendPolicy>,
}

impl LockOptions {
	#[must_use]
	pub fn new(ttl: Duration, locking_timeout: Duration) -> Self {
		Self {
			ttl,
			locking_timeout,
			extend_schedule: 0.5,
			extends: None,
		}
	}

	#[must_use]
	pub fn extend_schedule(mut self, fraction: f64) -> Self {
		self.extend_schedule = fraction;
		self
	}

	#[must_use]
	pub fn extends(mut self, policy: ExtendPolicy) -> Self {
		self.extends = Some(policy);
		self
	}
}

impl fmt::Debug for LockOptions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LockOptions")
			.field("ttl", &self.ttl)
			.field("locking_timeout", &self.locking_timeout)
			.field("extend_schedule", &self.extend_schedule)
			.field("extends", &self.extends)
			.finish()
	}
}

/// How the auto-extender decides whether to keep a lock alive.
#[derive(Clone)]
pub enum ExtendPolicy {
	/// Up to this many extensions, each with the original TTL.
	Count(u32),
	/// Custom decision from the attempt counter (starting at 0).
	Decide(Arc<dyn Fn(u32) -> ExtendDecision + Send + Sync>),
}

impl ExtendPolicy {
	pub(crate) fn decide(&self, attempt: u32) -> ExtendDecision {
		match self {
			Self::Count(limit) => {
				if attempt < *limit {
					ExtendDecision::Extend
				} else {
					ExtendDecision::Stop
				}
			}
			Self::Decide(decide) => match decide(attempt) {
				ExtendDecision::ExtendFor(ttl) if ttl.is_zero() => ExtendDecision::Stop,
				decision => decision,
			},
		}
	}
}

impl fmt::Debug for ExtendPolicy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Count(limit) => f.debug_tuple("Count").field(limit).finish(),
			Self::Decide(_) => f.write_str("Decide(..)"),
		}
	}
}

/// One auto-extend verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendDecision {
	/// Stop extending; the lock runs out at its current deadline.
	Stop,
	/// Extend with the TTL the lock was acquired with.
	Extend,
	/// Extend once with this TTL; a zero duration stops instead.
	ExtendFor(Duration),
}
