//! Client for the ordered lock service.
//!
//! A [`LockClient`] keeps one connection to the server alive, reconnecting
//! with exponential backoff, and exposes lock acquire/extend/release plus a
//! `with_lock` critical-section helper that auto-extends the lease while a
//! handler runs. Lifecycle and error events stream to embedders over a
//! broadcast channel.
//!
//! ```no_run
//! use std::time::Duration;
//! use lock_client::{ClientConfig, ExtendPolicy, LockClient, LockOptions};
//!
//! # async fn example() -> Result<(), lock_client::ClientError> {
//! let client = LockClient::connect(ClientConfig::new("127.0.0.1"));
//! let options = LockOptions::new(Duration::from_secs(10), Duration::from_secs(30)).extends(ExtendPolicy::Count(5));
//!
//! let report = client
//! 	.with_lock("reports/42", &options, |lock| async move {
//! 		// The lock is held (and kept alive) for the whole closure.
//! 		format!("rendered under {}", lock.lock_id())
//! 	})
//! 	.await?;
//! # let _ = report;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod error;
mod events;
mod extender;
mod session;

pub use client::{LockClient, LockHandle, Resources};
pub use config::{ClientConfig, ExtendDecision, ExtendPolicy, LockOptions, ReconnectConfig};
pub use error::ClientError;
pub use events::{ErrorInfo, LogEvent, SessionEvent};
