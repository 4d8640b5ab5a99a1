use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::errors::Error;
use crate::key::Endpoint;
use crate::node::{ConnNode, ConnState};
use crate::waitq::WaitQueue;

/// Every connection to one endpoint, plus the wait queue for tasks
/// awaiting idle capacity there.
pub(crate) struct ConnPool {
	pub(crate) endpoint: Endpoint,
	pub(crate) key: u32,
	// Written only under the table write lock, scanned under the read lock.
	pub(crate) conn_list: RwLock<VecDeque<Arc<ConnNode>>>,
	wq: WaitQueue,
	upref: AtomicU32,
	nr_connections: AtomicUsize,
	nr_idle_connections: AtomicUsize,
	nr_waits: AtomicU64,
}

impl ConnPool {
	pub fn new(endpoint: Endpoint) -> Self {
		Self {
			endpoint,
			key: endpoint.key(),
			conn_list: RwLock::new(VecDeque::new()),
			wq: WaitQueue::default(),
			upref: AtomicU32::new(0),
			nr_connections: AtomicUsize::new(0),
			nr_idle_connections: AtomicUsize::new(0),
			nr_waits: AtomicU64::new(0),
		}
	}

	pub fn connections(&self) -> usize {
		self.nr_connections.load(Ordering::SeqCst)
	}

	pub fn idle_connections(&self) -> usize {
		self.nr_idle_connections.load(Ordering::SeqCst)
	}

	pub fn waits(&self) -> u64 {
		self.nr_waits.load(Ordering::Relaxed)
	}

	pub fn inc_connections(&self) {
		self.nr_connections.fetch_add(1, Ordering::SeqCst);
	}

	pub fn dec_connections(&self) {
		self.nr_connections.fetch_sub(1, Ordering::SeqCst);
	}

	pub fn inc_idle(&self) {
		self.nr_idle_connections.fetch_add(1, Ordering::SeqCst);
	}

	pub fn dec_idle(&self) {
		self.nr_idle_connections.fetch_sub(1, Ordering::SeqCst);
	}

	pub fn wake_one(&self) {
		self.wq.wake_one();
	}

	/// Scan for a ready connection and take exclusive ownership of it.
	/// Caller holds the table read lock.
	pub fn try_claim(&self, wait_started_us: u64) -> Result<Arc<ConnNode>, Error> {
		let conns = self.conn_list.read();
		// Stays true only while every visited node could be inspected and
		// none was usable: the all-paths-down verdict. A locked node means
		// we never saw its state, so the verdict is off the table.
		let mut all_paths_down = true;
		for conn in conns.iter() {
			if !conn.try_lock() {
				all_paths_down = false;
				continue;
			}
			if conn.state() == ConnState::Ready {
				self.dec_idle();
				conn.set_state(ConnState::Active);
				conn.begin_use(wait_started_us);
				return Ok(conn.clone());
			}
			conn.unlock();
		}

		if conns.is_empty() {
			debug!(endpoint = %self.endpoint, "pool has no connections");
			Err(Error::NotFound)
		} else if all_paths_down {
			debug!(endpoint = %self.endpoint, "all paths down");
			Err(Error::AllPathsDown)
		} else {
			debug!(endpoint = %self.endpoint, "every connection busy");
			Err(Error::Busy)
		}
	}

	/// Block until the pool reports idle capacity or the deadline passes.
	/// Caller must hold a `PoolRef` and must not hold the table lock.
	pub async fn wait_for_idle(&self, deadline: Instant) -> bool {
		self.nr_waits.fetch_add(1, Ordering::Relaxed);
		self.wq
			.wait_until(deadline, || self.idle_connections() > 0)
			.await
	}

	/// Teardown gate. Caller holds the table write lock and unlinks the
	/// pool only on Ok.
	pub fn check_teardown(&self) -> Result<(), Error> {
		let upref = self.upref.load(Ordering::SeqCst);
		if upref != 0 {
			error!(endpoint = %self.endpoint, upref, "pool teardown refused, pool is referenced");
			return Err(Error::Busy);
		}
		if self.wq.has_waiters() {
			error!(endpoint = %self.endpoint, "pool teardown refused, tasks are waiting");
			return Err(Error::Busy);
		}
		if !self.conn_list.read().is_empty() {
			error!(endpoint = %self.endpoint, "pool teardown refused, connection list not empty");
			return Err(Error::Busy);
		}
		debug_assert_eq!(self.connections(), 0);
		debug_assert_eq!(self.idle_connections(), 0);
		info!(endpoint = %self.endpoint, "connection pool destroyed");
		Ok(())
	}

	pub fn snapshot(&self) -> PoolSnapshot {
		PoolSnapshot {
			endpoint: self.endpoint,
			nr_connections: self.connections(),
			nr_idle_connections: self.idle_connections(),
			nr_waits: self.waits(),
		}
	}
}

/// Counter snapshot of one pool, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
	pub endpoint: Endpoint,
	pub nr_connections: usize,
	pub nr_idle_connections: usize,
	pub nr_waits: u64,
}

/// Transient pool reference, the only way a pool pointer survives outside
/// the table lock. Construct while the pool is still pinned (table lock
/// held, or a claimed node in hand); the count is dropped via Drop.
pub(crate) struct PoolRef {
	pool: Arc<ConnPool>,
}

impl PoolRef {
	pub fn new(pool: Arc<ConnPool>) -> Self {
		pool.upref.fetch_add(1, Ordering::SeqCst);
		Self { pool }
	}
}

impl Deref for PoolRef {
	type Target = ConnPool;

	fn deref(&self) -> &ConnPool {
		&self.pool
	}
}

impl Drop for PoolRef {
	fn drop(&mut self) {
		self.pool.upref.fetch_sub(1, Ordering::SeqCst);
	}
}
