use std::net::SocketAddr;

use lock_core::LockManager;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::Connection;
use crate::error::Result;

/// Accept loop of the lock service.
///
/// Owns the listener and the lock manager task; every accepted socket gets
/// its own connection task wired to the shared manager handle.
pub struct LockServer {
	listener: TcpListener,
	manager: LockManager,
	/// Kept so the manager outlives every connection's teardown; the task
	/// ends on its own once the last handle is dropped.
	_manager_task: JoinHandle<()>,
	shutdown: CancellationToken,
}

impl LockServer {
	/// Binds the listener and spawns the lock manager.
	pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
		let listener = TcpListener::bind(addr).await?;
		let (manager, manager_task) = LockManager::spawn();
		Ok(Self {
			listener,
			manager,
			_manager_task: manager_task,
			shutdown: CancellationToken::new(),
		})
	}

	/// Address the listener actually bound (useful with port 0).
	pub fn local_addr(&self) -> Result<SocketAddr> {
		Ok(self.listener.local_addr()?)
	}

	/// Handle to the shared lock manager.
	#[must_use]
	pub fn manager(&self) -> LockManager {
		self.manager.clone()
	}

	/// Token that stops the accept loop and tears down live connections.
	#[must_use]
	pub fn shutdown_token(&self) -> CancellationToken {
		self.shutdown.clone()
	}

	/// Accepts connections until the shutdown token fires.
	pub async fn run(self) -> Result<()> {
		info!(addr = %self.listener.local_addr()?, "lock server listening");
		loop {
			tokio::select! {
				accepted = self.listener.accept() => match accepted {
					Ok((socket, peer)) => {
						if let Err(error) = socket.set_nodelay(true) {
							warn!(%peer, %error, "failed to set nodelay");
						}
						let connection = Connection::new(self.manager.clone(), self.shutdown.child_token());
						tokio::spawn(connection.run(socket, peer));
					}
					Err(error) => warn!(%error, "accept failed"),
				},
				() = self.shutdown.cancelled() => break,
			}
		}
		info!("lock server stopped");
		Ok(())
	}
}
