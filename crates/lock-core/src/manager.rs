//! The serialized operator owning every lock table.
//!
//! All mutations run on one task: commands arrive over an mpsc channel and
//! deadline firings come out of a [`DelayQueue`] polled by the same loop, so
//! acquire, release, extend, expiry and connection teardown take effect
//! atomically in arrival order. Nothing in here awaits I/O; replies leave
//! through oneshot channels after the state change is complete.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::{debug, info};

use crate::error::{AcquireError, LockOpError};
use crate::types::{LockId, OwnerId};

/// Counters describing the manager's current tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
	pub held: usize,
	pub waiting: usize,
	pub resources: usize,
}

enum Command {
	Acquire {
		owner: OwnerId,
		resources: Vec<String>,
		ttl: Duration,
		locking_timeout: Duration,
		reply: oneshot::Sender<Result<LockId, AcquireError>>,
	},
	Release {
		owner: OwnerId,
		lock_id: LockId,
		reply: oneshot::Sender<Result<(), LockOpError>>,
	},
	Extend {
		owner: OwnerId,
		lock_id: LockId,
		ttl: Option<Duration>,
		reply: oneshot::Sender<Result<(), LockOpError>>,
	},
	OwnerClosed {
		owner: OwnerId,
		done: oneshot::Sender<()>,
	},
	Stats {
		reply: oneshot::Sender<Stats>,
	},
}

enum Deadline {
	LockingTimeout(LockId),
	Expiry(LockId),
}

enum Phase {
	Waiting { reply: oneshot::Sender<Result<LockId, AcquireError>> },
	Held,
}

struct Entry {
	owner: OwnerId,
	/// Deduplicated, first-occurrence order. Queue membership always uses
	/// the sorted order instead.
	resources: Vec<String>,
	/// TTL given at acquire time; the default for extends.
	ttl: Duration,
	phase: Phase,
	timer: Option<Key>,
}

enum Wake {
	Command(Command),
	Deadline(Deadline, Key),
	Shutdown,
}

/// Cloneable handle to the lock manager task.
///
/// Dropping every handle shuts the task down; pending waiters then resolve
/// as `Closed`.
#[derive(Clone)]
pub struct LockManager {
	commands: mpsc::UnboundedSender<Command>,
}

impl LockManager {
	/// Spawns the manager task and returns its handle.
	#[must_use]
	pub fn spawn() -> (Self, JoinHandle<()>) {
		let (commands, command_rx) = mpsc::unbounded_channel();
		let task = tokio::spawn(LockTable::default().run(command_rx));
		(Self { commands }, task)
	}

	/// Acquires a lock on `resources`, waiting at most `locking_timeout`
	/// behind earlier requests. Resolves once the lock is held, the timeout
	/// elapses, or the owning connection goes away.
	pub async fn acquire(&self, owner: OwnerId, resources: Vec<String>, ttl: Duration, locking_timeout: Duration) -> Result<LockId, AcquireError> {
		let (reply, response) = oneshot::channel();
		self
			.commands
			.send(Command::Acquire {
				owner,
				resources,
				ttl,
				locking_timeout,
				reply,
			})
			.map_err(|_| AcquireError::Closed)?;
		response.await.map_err(|_| AcquireError::Closed)?
	}

	/// Releases a held lock and promotes whoever became eligible.
	pub async fn release(&self, owner: OwnerId, lock_id: LockId) -> Result<(), LockOpError> {
		let (reply, response) = oneshot::channel();
		self.commands.send(Command::Release { owner, lock_id, reply }).map_err(|_| LockOpError::Closed)?;
		response.await.map_err(|_| LockOpError::Closed)?
	}

	/// Re-arms a held lock's expiry at `now + ttl`; the acquire-time TTL
	/// applies when `ttl` is `None`.
	pub async fn extend(&self, owner: OwnerId, lock_id: LockId, ttl: Option<Duration>) -> Result<(), LockOpError> {
		let (reply, response) = oneshot::channel();
		self.commands.send(Command::Extend { owner, lock_id, ttl, reply }).map_err(|_| LockOpError::Closed)?;
		response.await.map_err(|_| LockOpError::Closed)?
	}

	/// Cancels every waiting acquisition and releases every held lock of a
	/// closed connection. Returns once the tables are quiescent.
	pub async fn owner_closed(&self, owner: OwnerId) {
		let (done, finished) = oneshot::channel();
		if self.commands.send(Command::OwnerClosed { owner, done }).is_ok() {
			let _ = finished.await;
		}
	}

	/// Snapshot of the table counters.
	pub async fn stats(&self) -> Stats {
		let (reply, response) = oneshot::channel();
		if self.commands.send(Command::Stats { reply }).is_err() {
			return Stats::default();
		}
		response.await.unwrap_or_default()
	}
}

#[derive(Default)]
struct LockTable {
	/// FIFO queue of acquisition ids per resource. The head is the entry
	/// that is (or will next be) held.
	queues: HashMap<String, VecDeque<LockId>>,
	entries: HashMap<LockId, Entry>,
	owners: HashMap<OwnerId, HashSet<LockId>>,
	timers: DelayQueue<Deadline>,
}

impl LockTable {
	async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
		loop {
			let wake = tokio::select! {
				command = commands.recv() => command.map_or(Wake::Shutdown, Wake::Command),
				Some(expired) = self.timers.next() => {
					let key = expired.key();
					Wake::Deadline(expired.into_inner(), key)
				}
			};
			match wake {
				Wake::Command(command) => self.apply(command),
				Wake::Deadline(deadline, key) => self.fire(deadline, key),
				Wake::Shutdown => break,
			}
		}
		debug!("lock manager stopped");
	}

	fn apply(&mut self, command: Command) {
		match command {
			Command::Acquire {
				owner,
				resources,
				ttl,
				locking_timeout,
				reply,
			} => self.acquire(owner, resources, ttl, locking_timeout, reply),
			Command::Release { owner, lock_id, reply } => {
				let _ = reply.send(self.release(&owner, &lock_id));
			}
			Command::Extend { owner, lock_id, ttl, reply } => {
				let _ = reply.send(self.extend(&owner, &lock_id, ttl));
			}
			Command::OwnerClosed { owner, done } => {
				self.owner_closed(&owner);
				let _ = done.send(());
			}
			Command::Stats { reply } => {
				let _ = reply.send(self.stats());
			}
		}
	}

	fn fire(&mut self, deadline: Deadline, key: Key) {
		match deadline {
			Deadline::LockingTimeout(lock_id) => self.locking_timeout(&lock_id, key),
			Deadline::Expiry(lock_id) => self.expire(&lock_id, key),
		}
	}

	fn acquire(&mut self, owner: OwnerId, resources: Vec<String>, ttl: Duration, locking_timeout: Duration, reply: oneshot::Sender<Result<LockId, AcquireError>>) {
		let resources = match validate(resources, ttl) {
			Ok(resources) => resources,
			Err(error) => {
				let _ = reply.send(Err(error));
				return;
			}
		};

		let lock_id = LockId::generate();
		// Canonical enqueue order: two requests sharing any resource end up
		// totally ordered on their shared queues, so neither can wait on the
		// other in both directions.
		let mut enqueue = resources.clone();
		enqueue.sort();
		for resource in &enqueue {
			self.queues.entry(resource.clone()).or_default().push_back(lock_id.clone());
		}
		self.owners.entry(owner).or_default().insert(lock_id.clone());
		self.entries.insert(
			lock_id.clone(),
			Entry {
				owner,
				resources,
				ttl,
				phase: Phase::Waiting { reply },
				timer: None,
			},
		);

		if self.eligible(&lock_id) {
			self.promote(&lock_id);
		} else {
			let key = self.timers.insert(Deadline::LockingTimeout(lock_id.clone()), locking_timeout);
			if let Some(entry) = self.entries.get_mut(&lock_id) {
				entry.timer = Some(key);
			}
			debug!(lock = %lock_id, owner = %owner, "acquisition queued");
		}
	}

	/// True when the entry is at the head of every one of its queues.
	fn eligible(&self, lock_id: &LockId) -> bool {
		self
			.entries
			.get(lock_id)
			.is_some_and(|entry| entry.resources.iter().all(|resource| self.queues.get(resource).and_then(VecDeque::front) == Some(lock_id)))
	}

	/// Turns a waiting entry into a held lock and answers its acquirer.
	fn promote(&mut self, lock_id: &LockId) {
		let Some(entry) = self.entries.get_mut(lock_id) else {
			return;
		};
		if let Some(key) = entry.timer.take() {
			self.timers.try_remove(&key);
		}
		entry.timer = Some(self.timers.insert(Deadline::Expiry(lock_id.clone()), entry.ttl));
		let phase = std::mem::replace(&mut entry.phase, Phase::Held);
		debug!(lock = %lock_id, owner = %entry.owner, "lock held");
		if let Phase::Waiting { reply } = phase {
			if reply.send(Ok(lock_id.clone())).is_err() {
				// Nobody is listening; the owner teardown will reclaim it.
				debug!(lock = %lock_id, "granted lock had no listener");
			}
		}
	}

	fn release(&mut self, owner: &OwnerId, lock_id: &LockId) -> Result<(), LockOpError> {
		let entry = self.entries.get(lock_id).ok_or(LockOpError::UnknownLock)?;
		if !matches!(entry.phase, Phase::Held) {
			// Waiting ids were never revealed to a client.
			return Err(LockOpError::UnknownLock);
		}
		if entry.owner != *owner {
			return Err(LockOpError::NotOwner);
		}
		self.remove(lock_id);
		debug!(lock = %lock_id, "lock released");
		Ok(())
	}

	fn extend(&mut self, owner: &OwnerId, lock_id: &LockId, ttl: Option<Duration>) -> Result<(), LockOpError> {
		let Some(entry) = self.entries.get_mut(lock_id) else {
			return Err(LockOpError::UnknownLock);
		};
		if !matches!(entry.phase, Phase::Held) {
			return Err(LockOpError::UnknownLock);
		}
		if entry.owner != *owner {
			return Err(LockOpError::NotOwner);
		}
		let ttl = ttl.unwrap_or(entry.ttl);
		if let Some(key) = entry.timer.take() {
			self.timers.try_remove(&key);
		}
		entry.timer = Some(self.timers.insert(Deadline::Expiry(lock_id.clone()), ttl));
		debug!(lock = %lock_id, ?ttl, "lock extended");
		Ok(())
	}

	fn expire(&mut self, lock_id: &LockId, key: Key) {
		let Some(entry) = self.entries.get_mut(lock_id) else {
			// Fired after release; nothing left to do.
			return;
		};
		if entry.timer != Some(key) {
			// Stale firing, the deadline was re-armed in the meantime.
			return;
		}
		// The firing consumed the key; drop it so remove() cannot cancel a
		// reused slot.
		entry.timer = None;
		info!(lock = %lock_id, "lock expired");
		self.remove(lock_id);
	}

	fn locking_timeout(&mut self, lock_id: &LockId, key: Key) {
		let Some(entry) = self.entries.get_mut(lock_id) else {
			return;
		};
		if entry.timer != Some(key) {
			return;
		}
		entry.timer = None;
		debug!(lock = %lock_id, "acquisition timed out");
		if let Some(removed) = self.remove(lock_id) {
			if let Phase::Waiting { reply } = removed.phase {
				let _ = reply.send(Err(AcquireError::Timeout));
			}
		}
	}

	fn owner_closed(&mut self, owner: &OwnerId) {
		let Some(owned) = self.owners.remove(owner) else {
			return;
		};
		let mut lock_ids: Vec<LockId> = owned.into_iter().collect();
		lock_ids.sort();
		info!(owner = %owner, locks = lock_ids.len(), "reclaiming locks of closed connection");
		// Cancel the waiters first; releasing a held lock below must not be
		// able to promote an acquisition of the same dead connection.
		for lock_id in &lock_ids {
			let waiting = self.entries.get(lock_id).is_some_and(|entry| matches!(entry.phase, Phase::Waiting { .. }));
			if waiting {
				if let Some(removed) = self.remove(lock_id) {
					if let Phase::Waiting { reply } = removed.phase {
						let _ = reply.send(Err(AcquireError::Cancelled));
					}
				}
			}
		}
		for lock_id in &lock_ids {
			self.remove(lock_id);
		}
	}

	/// Tears the entry out of every index, then re-examines the head of each
	/// queue it was heading. Returns the removed entry.
	fn remove(&mut self, lock_id: &LockId) -> Option<Entry> {
		let entry = self.entries.remove(lock_id)?;
		if let Some(key) = entry.timer {
			self.timers.try_remove(&key);
		}
		if let Some(owned) = self.owners.get_mut(&entry.owner) {
			owned.remove(lock_id);
			if owned.is_empty() {
				self.owners.remove(&entry.owner);
			}
		}
		let mut freed = Vec::new();
		for resource in &entry.resources {
			let Some(queue) = self.queues.get_mut(resource) else {
				continue;
			};
			if queue.front() == Some(lock_id) {
				queue.pop_front();
				freed.push(resource.clone());
			} else {
				queue.retain(|queued| queued != lock_id);
			}
			if queue.is_empty() {
				self.queues.remove(resource);
			}
		}
		self.wake(freed);
		Some(entry)
	}

	/// Promotes newly-eligible heads of the freed queues, in resource-id
	/// order so the schedule is deterministic.
	fn wake(&mut self, mut freed: Vec<String>) {
		freed.sort();
		for resource in freed {
			let Some(head) = self.queues.get(&resource).and_then(VecDeque::front).cloned() else {
				continue;
			};
			let waiting = self.entries.get(&head).is_some_and(|entry| matches!(entry.phase, Phase::Waiting { .. }));
			if waiting && self.eligible(&head) {
				self.promote(&head);
			}
		}
	}

	fn stats(&self) -> Stats {
		let held = self.entries.values().filter(|entry| matches!(entry.phase, Phase::Held)).count();
		Stats {
			held,
			waiting: self.entries.len() - held,
			resources: self.queues.len(),
		}
	}
}

fn validate(resources: Vec<String>, ttl: Duration) -> Result<Vec<String>, AcquireError> {
	if resources.is_empty() {
		return Err(AcquireError::Invalid("no resources named".to_string()));
	}
	if ttl.is_zero() {
		return Err(AcquireError::Invalid("ttl must be positive".to_string()));
	}
	let mut seen = HashSet::new();
	let mut deduped = Vec::with_capacity(resources.len());
	for resource in resources {
		if resource.is_empty() {
			return Err(AcquireError::Invalid("empty resource id".to_string()));
		}
		if seen.insert(resource.clone()) {
			deduped.push(resource);
		}
	}
	Ok(deduped)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::time::{sleep, timeout, Duration};

	fn ids(names: &[&str]) -> Vec<String> {
		names.iter().map(ToString::to_string).collect()
	}

	const LONG: Duration = Duration::from_secs(10);

	#[tokio::test]
	async fn free_resources_are_granted_immediately() {
		let (manager, _task) = LockManager::spawn();
		let owner = OwnerId::new();

		let lock_id = manager.acquire(owner, ids(&["a"]), LONG, LONG).await.unwrap();
		assert!(!lock_id.as_str().is_empty());
		assert_eq!(manager.stats().await, Stats { held: 1, waiting: 0, resources: 1 });

		manager.release(owner, lock_id).await.unwrap();
		assert_eq!(manager.stats().await, Stats::default());
	}

	#[tokio::test]
	async fn contended_resource_is_granted_in_fifo_order() {
		let (manager, _task) = LockManager::spawn();
		let first_owner = OwnerId::new();
		let second_owner = OwnerId::new();

		let first = manager.acquire(first_owner, ids(&["a"]), LONG, LONG).await.unwrap();

		let second = {
			let manager = manager.clone();
			tokio::spawn(async move { manager.acquire(second_owner, ids(&["a"]), LONG, LONG).await })
		};
		sleep(Duration::from_millis(20)).await;
		assert_eq!(manager.stats().await.waiting, 1);

		manager.release(first_owner, first.clone()).await.unwrap();
		let second = second.await.unwrap().unwrap();
		assert_ne!(first, second);
		assert_eq!(manager.stats().await, Stats { held: 1, waiting: 0, resources: 1 });
	}

	#[tokio::test]
	async fn opposite_resource_orders_do_not_deadlock() {
		let (manager, _task) = LockManager::spawn();
		let first_owner = OwnerId::new();
		let second_owner = OwnerId::new();

		let first = manager.acquire(first_owner, ids(&["a", "b"]), LONG, LONG).await.unwrap();
		let second = {
			let manager = manager.clone();
			tokio::spawn(async move { manager.acquire(second_owner, ids(&["b", "a"]), LONG, LONG).await })
		};
		sleep(Duration::from_millis(20)).await;

		manager.release(first_owner, first).await.unwrap();
		let second = timeout(Duration::from_secs(1), second).await.unwrap().unwrap().unwrap();
		manager.release(second_owner, second).await.unwrap();
	}

	#[tokio::test]
	async fn waiting_acquisition_times_out() {
		let (manager, _task) = LockManager::spawn();
		let holder = OwnerId::new();
		let waiter = OwnerId::new();

		let _held = manager.acquire(holder, ids(&["a"]), LONG, LONG).await.unwrap();
		let error = manager.acquire(waiter, ids(&["a"]), LONG, Duration::from_millis(50)).await.unwrap_err();
		assert_eq!(error, AcquireError::Timeout);

		// The holder is untouched and the queue no longer carries the waiter.
		assert_eq!(manager.stats().await, Stats { held: 1, waiting: 0, resources: 1 });
	}

	#[tokio::test]
	async fn timed_out_waiter_unblocks_its_other_queues() {
		let (manager, _task) = LockManager::spawn();
		let holder = OwnerId::new();
		let slow = OwnerId::new();
		let fast = OwnerId::new();

		let _held_a = manager.acquire(holder, ids(&["a"]), LONG, LONG).await.unwrap();

		// `slow` heads the queue for b but never gets a, so `fast` is stuck
		// behind it until the timeout removes it.
		let slow_attempt = {
			let manager = manager.clone();
			tokio::spawn(async move { manager.acquire(slow, ids(&["a", "b"]), LONG, Duration::from_millis(50)).await })
		};
		sleep(Duration::from_millis(10)).await;
		let fast_attempt = {
			let manager = manager.clone();
			tokio::spawn(async move { manager.acquire(fast, ids(&["b"]), LONG, LONG).await })
		};

		assert_eq!(slow_attempt.await.unwrap().unwrap_err(), AcquireError::Timeout);
		let granted = timeout(Duration::from_secs(1), fast_attempt).await.unwrap().unwrap().unwrap();
		manager.release(fast, granted).await.unwrap();
	}

	#[tokio::test]
	async fn held_lock_expires_at_its_ttl() {
		let (manager, _task) = LockManager::spawn();
		let holder = OwnerId::new();
		let waiter = OwnerId::new();

		let held = manager.acquire(holder, ids(&["a"]), Duration::from_millis(50), LONG).await.unwrap();
		let granted = manager.acquire(waiter, ids(&["a"]), LONG, Duration::from_secs(5)).await.unwrap();
		assert_ne!(held, granted);

		// The expired id is gone for good.
		assert_eq!(manager.release(holder, held).await.unwrap_err(), LockOpError::UnknownLock);
	}

	#[tokio::test]
	async fn extend_postpones_expiry() {
		let (manager, _task) = LockManager::spawn();
		let holder = OwnerId::new();

		let held = manager.acquire(holder, ids(&["a"]), Duration::from_millis(200), LONG).await.unwrap();
		sleep(Duration::from_millis(120)).await;
		manager.extend(holder, held.clone(), None).await.unwrap();
		sleep(Duration::from_millis(150)).await;

		// Without the extend this would already have expired.
		assert_eq!(manager.stats().await.held, 1);
		manager.release(holder, held).await.unwrap();
	}

	#[tokio::test]
	async fn extend_accepts_an_explicit_ttl() {
		let (manager, _task) = LockManager::spawn();
		let holder = OwnerId::new();

		let held = manager.acquire(holder, ids(&["a"]), Duration::from_millis(40), LONG).await.unwrap();
		manager.extend(holder, held.clone(), Some(Duration::from_secs(5))).await.unwrap();
		sleep(Duration::from_millis(80)).await;
		assert_eq!(manager.stats().await.held, 1);
		manager.release(holder, held).await.unwrap();
	}

	#[tokio::test]
	async fn non_owners_cannot_release_or_extend() {
		let (manager, _task) = LockManager::spawn();
		let owner = OwnerId::new();
		let intruder = OwnerId::new();

		let held = manager.acquire(owner, ids(&["a"]), LONG, LONG).await.unwrap();
		assert_eq!(manager.release(intruder, held.clone()).await.unwrap_err(), LockOpError::NotOwner);
		assert_eq!(manager.extend(intruder, held.clone(), None).await.unwrap_err(), LockOpError::NotOwner);

		// The failed attempts changed nothing.
		assert_eq!(manager.stats().await.held, 1);
		manager.release(owner, held).await.unwrap();
	}

	#[tokio::test]
	async fn unknown_and_double_release_are_rejected() {
		let (manager, _task) = LockManager::spawn();
		let owner = OwnerId::new();

		assert_eq!(manager.release(owner, LockId::from("missing")).await.unwrap_err(), LockOpError::UnknownLock);

		let held = manager.acquire(owner, ids(&["a"]), LONG, LONG).await.unwrap();
		manager.release(owner, held.clone()).await.unwrap();
		assert_eq!(manager.release(owner, held).await.unwrap_err(), LockOpError::UnknownLock);
	}

	#[tokio::test]
	async fn closing_an_owner_releases_and_cancels_everything() {
		let (manager, _task) = LockManager::spawn();
		let doomed = OwnerId::new();
		let survivor = OwnerId::new();

		let _held = manager.acquire(doomed, ids(&["a"]), LONG, LONG).await.unwrap();
		let _also_held = manager.acquire(doomed, ids(&["b"]), LONG, LONG).await.unwrap();
		let waiting = {
			let manager = manager.clone();
			tokio::spawn(async move { manager.acquire(doomed, ids(&["c", "a"]), LONG, LONG).await })
		};
		sleep(Duration::from_millis(10)).await;

		let blocked = {
			let manager = manager.clone();
			tokio::spawn(async move { manager.acquire(survivor, ids(&["a", "b"]), LONG, LONG).await })
		};
		sleep(Duration::from_millis(10)).await;

		manager.owner_closed(doomed).await;

		assert_eq!(waiting.await.unwrap().unwrap_err(), AcquireError::Cancelled);
		let granted = timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap().unwrap();
		manager.release(survivor, granted).await.unwrap();
		assert_eq!(manager.stats().await, Stats::default());
	}

	#[tokio::test]
	async fn duplicate_resources_collapse_to_one_queue_slot() {
		let (manager, _task) = LockManager::spawn();
		let owner = OwnerId::new();

		let held = manager.acquire(owner, ids(&["a", "a", "a"]), LONG, LONG).await.unwrap();
		assert_eq!(manager.stats().await, Stats { held: 1, waiting: 0, resources: 1 });
		manager.release(owner, held).await.unwrap();

		// The queue is clean: the next acquire is granted immediately.
		let again = manager.acquire(owner, ids(&["a"]), LONG, LONG).await.unwrap();
		manager.release(owner, again).await.unwrap();
	}

	#[tokio::test]
	async fn invalid_acquisitions_are_rejected() {
		let (manager, _task) = LockManager::spawn();
		let owner = OwnerId::new();

		assert!(matches!(manager.acquire(owner, vec![], LONG, LONG).await.unwrap_err(), AcquireError::Invalid(_)));
		assert!(matches!(manager.acquire(owner, ids(&[""]), LONG, LONG).await.unwrap_err(), AcquireError::Invalid(_)));
		assert!(matches!(
			manager.acquire(owner, ids(&["a"]), Duration::ZERO, LONG).await.unwrap_err(),
			AcquireError::Invalid(_)
		));
		assert_eq!(manager.stats().await, Stats::default());
	}
}
