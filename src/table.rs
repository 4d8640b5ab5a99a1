use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use prometheus_client::registry::Registry;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::errors::Error;
use crate::key::Endpoint;
use crate::metrics::Metrics;
use crate::node::{ConnNode, ConnState};
use crate::pool::{ConnPool, PoolRef, PoolSnapshot};
use crate::stats::{ConnOp, div_safe, now_us};

// Fixed bucket count, no rehashing. Power of two for mask indexing;
// chains stay short for the endpoint cardinalities a node talks to.
const BUCKET_COUNT: usize = 256;

struct Buckets {
	chains: Vec<Vec<Arc<ConnPool>>>,
}

impl Buckets {
	fn new() -> Self {
		Self {
			chains: vec![Vec::new(); BUCKET_COUNT],
		}
	}

	fn chain(&self, key: u32) -> &Vec<Arc<ConnPool>> {
		&self.chains[key as usize & (BUCKET_COUNT - 1)]
	}

	fn chain_mut(&mut self, key: u32) -> &mut Vec<Arc<ConnPool>> {
		&mut self.chains[key as usize & (BUCKET_COUNT - 1)]
	}

	// Collisions are resolved by endpoint equality, never by key alone.
	fn lookup(&self, endpoint: &Endpoint) -> Option<&Arc<ConnPool>> {
		let key = endpoint.key();
		self.chain(key).iter().find(|pool| {
			if pool.endpoint == *endpoint {
				debug_assert_eq!(pool.key, key);
				true
			} else {
				false
			}
		})
	}

	fn link(&mut self, pool: Arc<ConnPool>) {
		let key = pool.key;
		self.chain_mut(key).push(pool);
	}
}

/// Hash table from endpoint to connection pool, guarded by one
/// reader/writer lock. Readers look up and claim connections; writers
/// change pool-set membership and list structure.
pub struct ConnTable {
	buckets: RwLock<Buckets>,
	metrics: Metrics,
}

impl Default for ConnTable {
	fn default() -> Self {
		Self::new()
	}
}

impl ConnTable {
	pub fn new() -> Self {
		Self {
			buckets: RwLock::new(Buckets::new()),
			metrics: Metrics::default(),
		}
	}

	/// Same table, with its counters registered for export.
	pub fn with_registry(registry: &mut Registry) -> Self {
		Self {
			buckets: RwLock::new(Buckets::new()),
			metrics: Metrics::new(registry),
		}
	}

	/// Attach a new connection, creating the endpoint's pool on first use.
	/// The connection arrives Ready, so one waiter is woken.
	pub fn insert(&self, node: ConnNode) -> Result<Arc<ConnNode>, Error> {
		let node = Arc::new(node);
		let endpoint = node.endpoint();

		let mut buckets = self.buckets.write();
		let pool = match buckets.lookup(&endpoint) {
			Some(pool) => pool.clone(),
			None => {
				// Allocate outside the lock; re-check afterwards because a
				// concurrent inserter may have linked the pool meanwhile, in
				// which case the fresh allocation loses and is discarded.
				drop(buckets);
				let fresh = Arc::new(ConnPool::new(endpoint));
				buckets = self.buckets.write();
				match buckets.lookup(&endpoint) {
					Some(existing) => existing.clone(),
					None => {
						buckets.link(fresh.clone());
						fresh
					},
				}
			},
		};

		node.attach(&pool);
		pool.conn_list.write().push_front(node.clone());
		pool.inc_connections();
		node.set_state(ConnState::Ready);
		pool.inc_idle();

		// upref bridges the gap between unlock and wake so a concurrent
		// destroy cannot free the pool underneath us.
		let wake = PoolRef::new(pool);
		drop(buckets);
		wake.wake_one();
		drop(wake);

		self.metrics.inserts.get_or_create(&endpoint.into()).inc();
		Ok(node)
	}

	/// Detach a connection. Fails with `Busy` while any task owns it; the
	/// caller keeps the `Arc` and drops it when done.
	pub fn remove(&self, node: &Arc<ConnNode>) -> Result<(), Error> {
		let buckets = self.buckets.write();
		let res = Self::unlink_conn(node);
		drop(buckets);
		if res.is_ok() {
			self.metrics
				.removes
				.get_or_create(&node.endpoint().into())
				.inc();
		}
		res
	}

	// Unlink helper; caller holds the table write lock.
	fn unlink_conn(node: &Arc<ConnNode>) -> Result<(), Error> {
		if !node.try_lock() {
			warn!(endpoint = %node.endpoint(), "connection is in use, cannot remove");
			return Err(Error::Busy);
		}
		let pool = node
			.pool()
			.expect("removing a connection that was never inserted");
		debug_assert!(node.state() != ConnState::Active);
		if node.state() == ConnState::Ready {
			pool.dec_idle();
			node.set_state(ConnState::Zombie);
		}
		let mut conns = pool.conn_list.write();
		let idx = conns
			.iter()
			.position(|c| Arc::ptr_eq(c, node))
			.expect("connection not linked in its pool");
		conns.remove(idx);
		drop(conns);
		pool.dec_connections();
		// The conn lock is retained: a detached zombie must not be claimed.
		Ok(())
	}

	/// Advisory lookup: the first connection of the endpoint's pool, with
	/// no ownership taken and no validity assured after return.
	pub fn peek(&self, ip: &str, port: u16) -> Option<Arc<ConnNode>> {
		let endpoint = Endpoint::parse(ip, port).ok()?;
		let buckets = self.buckets.read();
		let pool = buckets.lookup(&endpoint)?;
		let conns = pool.conn_list.read();
		conns.front().cloned()
	}

	/// One representative connection, or None when the table is empty.
	/// Callers drain the table by alternating iter and remove.
	pub fn iter(&self) -> Option<Arc<ConnNode>> {
		let buckets = self.buckets.read();
		for chain in &buckets.chains {
			for pool in chain {
				if let Some(conn) = pool.conn_list.read().front() {
					return Some(conn.clone());
				}
			}
		}
		None
	}

	/// Claim a ready connection to (ip, port), blocking on the pool's wait
	/// queue when every candidate is busy. The returned connection is
	/// exclusively owned until handed back through [`ConnTable::put`].
	pub async fn timed_get(
		&self,
		ip: &str,
		port: u16,
		timeout: Duration,
	) -> Result<Arc<ConnNode>, Error> {
		let endpoint = Endpoint::parse(ip, port)?;
		let labels = endpoint.into();
		self.metrics.lookups.get_or_create(&labels).inc();
		let wait_started = now_us();
		let deadline = deadline_after(timeout);

		loop {
			// Fast path under the read lock; on contention carry a PoolRef
			// out so the pool survives while we sleep on its wait queue.
			let waitable = {
				let buckets = self.buckets.read();
				let Some(pool) = buckets.lookup(&endpoint) else {
					debug!(endpoint = %endpoint, "no pool for endpoint");
					return Err(Error::NotFound);
				};
				match pool.try_claim(wait_started) {
					Ok(conn) => return Ok(conn),
					Err(Error::Busy) => PoolRef::new(pool.clone()),
					Err(Error::AllPathsDown) => {
						debug_assert_eq!(pool.idle_connections(), 0);
						self.metrics.all_paths_down.get_or_create(&labels).inc();
						return Err(Error::AllPathsDown);
					},
					Err(err) => return Err(err),
				}
			};

			self.metrics.waits.get_or_create(&labels).inc();
			let woke = waitable.wait_for_idle(deadline).await;
			drop(waitable);
			if !woke {
				warn!(endpoint = %endpoint, "timed out waiting for a connection");
				self.metrics.timeouts.get_or_create(&labels).inc();
				return Err(Error::Timeout);
			}
		}
	}

	/// Hand a claimed connection back. The steps mirror the claim in
	/// reverse: state, pool reference, idle count, lock release, then a
	/// single wakeup while the reference still pins the pool.
	pub fn put(&self, node: &Arc<ConnNode>, op: ConnOp) {
		debug_assert!(node.is_locked(), "put without conn lock");
		match node.state() {
			ConnState::Active => {
				let Some(pool) = node.pool() else {
					node.unlock();
					return;
				};
				node.end_use(op);
				node.set_state(ConnState::Ready);
				let wake = PoolRef::new(pool);
				wake.inc_idle();
				node.unlock();
				wake.wake_one();
			},
			// error recovery path: just give the lock back
			_ => node.unlock(),
		}
	}

	/// Tear the whole table down. Busy connections and their pools are
	/// left in place and logged; returns how many connections were
	/// removed.
	pub fn destroy(&self) -> usize {
		let mut buckets = self.buckets.write();
		let mut removed = 0usize;
		for chain in &mut buckets.chains {
			chain.retain(|pool| {
				let conns: Vec<Arc<ConnNode>> = pool.conn_list.read().iter().cloned().collect();
				for conn in conns {
					match Self::unlink_conn(&conn) {
						Ok(()) => removed += 1,
						Err(_) => {
							error!(endpoint = %conn.endpoint(), "connection removal failed, keeping pool");
							return true;
						},
					}
				}
				pool.check_teardown().is_err()
			});
		}
		drop(buckets);
		info!(removed, "connection table cleanup");
		removed
	}

	/// Counter snapshot of one endpoint's pool.
	pub fn pool_snapshot(&self, ip: &str, port: u16) -> Option<PoolSnapshot> {
		let endpoint = Endpoint::parse(ip, port).ok()?;
		let buckets = self.buckets.read();
		buckets.lookup(&endpoint).map(|pool| pool.snapshot())
	}

	/// Usage distribution, one row per connection.
	pub fn dump<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
		writeln!(
			w,
			"HOST\tSTATE\tRETRIES\tLOOKUPS\tWAITS\tAVG_WAIT(us)\tAVG_LAT_GET(us)\tAVG_LAT_PUT(us)\tSEND(kb) RCV(kb)"
		)?;
		let buckets = self.buckets.read();
		for chain in &buckets.chains {
			for pool in chain {
				let waits = pool.waits();
				for conn in pool.conn_list.read().iter() {
					let snap = conn.snapshot();
					let lookups = snap.stats.nr_lookups;
					writeln!(
						w,
						"{} {} {} {} {} {} {} {} {} {}",
						snap.endpoint,
						snap.state,
						snap.nr_retry_attempts,
						lookups,
						waits,
						div_safe(snap.stats.tot_us_wait, lookups),
						div_safe(snap.stats.tot_us_get, lookups),
						div_safe(snap.stats.tot_us_put, lookups),
						snap.stats.tx_bytes >> 10,
						snap.stats.rx_bytes >> 10,
					)?;
				}
			}
		}
		Ok(())
	}
}

fn deadline_after(timeout: Duration) -> Instant {
	let now = Instant::now();
	now.checked_add(timeout)
		.unwrap_or_else(|| now + Duration::from_secs(86_400 * 365))
}

#[cfg(test)]
#[path = "table_tests.rs"]
mod tests;
