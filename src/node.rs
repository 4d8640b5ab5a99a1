use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use serde::Serialize;

use crate::errors::Error;
use crate::key::Endpoint;
use crate::pool::{ConnPool, PoolRef};
use crate::stats::{ConnOp, ConnStats, ConnStatsSnapshot, now_us};

const CONN_LOCKED: u32 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnState {
	Down,
	Ready,
	Active,
	Retry,
	Failed,
	Zombie,
}

impl ConnState {
	fn from_u8(v: u8) -> Self {
		match v {
			0 => ConnState::Down,
			1 => ConnState::Ready,
			2 => ConnState::Active,
			3 => ConnState::Retry,
			4 => ConnState::Failed,
			5 => ConnState::Zombie,
			_ => unreachable!("corrupt connection state {v}"),
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ConnState::Down => "DOWN",
			ConnState::Ready => "READY",
			ConnState::Active => "ACTIVE",
			ConnState::Retry => "RETRY",
			ConnState::Failed => "FAILED",
			ConnState::Zombie => "ZOMBIE",
		}
	}
}

impl fmt::Display for ConnState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One reusable connection to an endpoint. Exclusive use is conveyed by
/// the CONN_LOCKED bit, not by any surrounding lock; statistics are plain
/// atomics updated without it.
#[derive(Debug)]
pub struct ConnNode {
	endpoint: Endpoint,
	state: AtomicU8,
	flags: AtomicU32,
	pool: OnceLock<Weak<ConnPool>>,
	now_us: AtomicU64,
	nr_retry_attempts: AtomicU32,
	pub(crate) stats: ConnStats,
}

impl ConnNode {
	pub fn new(ip: &str, port: u16) -> Result<Self, Error> {
		Ok(Self::with_endpoint(Endpoint::parse(ip, port)?))
	}

	pub fn with_endpoint(endpoint: Endpoint) -> Self {
		Self {
			endpoint,
			state: AtomicU8::new(ConnState::Down as u8),
			flags: AtomicU32::new(0),
			pool: OnceLock::new(),
			now_us: AtomicU64::new(0),
			nr_retry_attempts: AtomicU32::new(0),
			stats: ConnStats::default(),
		}
	}

	pub fn endpoint(&self) -> Endpoint {
		self.endpoint
	}

	pub fn state(&self) -> ConnState {
		ConnState::from_u8(self.state.load(Ordering::Acquire))
	}

	pub(crate) fn set_state(&self, state: ConnState) {
		self.state.store(state as u8, Ordering::Release);
	}

	pub fn is_locked(&self) -> bool {
		self.flags.load(Ordering::Relaxed) & CONN_LOCKED != 0
	}

	// Acquire pairs with the Release in unlock: the new owner sees every
	// store the previous owner made before releasing.
	pub(crate) fn try_lock(&self) -> bool {
		self.flags.fetch_or(CONN_LOCKED, Ordering::Acquire) & CONN_LOCKED == 0
	}

	pub(crate) fn unlock(&self) {
		self.flags.fetch_and(!CONN_LOCKED, Ordering::Release);
	}

	pub(crate) fn attach(&self, pool: &Arc<ConnPool>) {
		let prev = self.pool.set(Arc::downgrade(pool));
		debug_assert!(prev.is_ok(), "connection attached twice");
	}

	// The pool outlives its nodes: teardown refuses a pool whose list is
	// non-empty, so the upgrade succeeds while this node is attached.
	pub(crate) fn pool(&self) -> Option<Arc<ConnPool>> {
		self.pool.get().and_then(Weak::upgrade)
	}

	// Claim accounting: wait latency ends, use latency starts.
	pub(crate) fn begin_use(&self, wait_started_us: u64) {
		let now = now_us();
		self.stats
			.tot_us_wait
			.fetch_add(now.saturating_sub(wait_started_us), Ordering::Relaxed);
		self.now_us.store(now, Ordering::Relaxed);
		self.stats.nr_lookups.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn end_use(&self, op: ConnOp) {
		let elapsed = now_us().saturating_sub(self.now_us.load(Ordering::Relaxed));
		let bucket = match op {
			ConnOp::Get => &self.stats.tot_us_get,
			ConnOp::Put => &self.stats.tot_us_put,
		};
		bucket.fetch_add(elapsed, Ordering::Relaxed);
	}

	/// The connection went bad in use or during a probe. Caller holds the
	/// conn lock with the node Active or Retry. The state store precedes
	/// the release so the next owner cannot observe a stale Active.
	pub fn mark_failed(&self) {
		assert!(self.is_locked(), "mark_failed without conn lock");
		match self.state() {
			ConnState::Active | ConnState::Retry => {
				self.set_state(ConnState::Failed);
				self.unlock();
			},
			other => panic!("mark_failed from {other}"),
		}
	}

	/// Take exclusive ownership for a retry probe. `Busy` when another
	/// task, or a scanner's transient test-and-set, holds the lock.
	pub fn mark_retry(&self) -> Result<(), Error> {
		if !self.try_lock() {
			return Err(Error::Busy);
		}
		if self.state() == ConnState::Ready {
			if let Some(pool) = self.pool() {
				pool.dec_idle();
			}
		}
		self.set_state(ConnState::Retry);
		self.nr_retry_attempts.fetch_add(1, Ordering::Relaxed);
		Ok(())
	}

	/// Complete a successful probe: back to Ready, lock released, one
	/// waiter woken. No-op unless the node is in Retry.
	pub fn mark_ready(&self) {
		if self.state() != ConnState::Retry {
			return;
		}
		assert!(self.is_locked(), "mark_ready without conn lock");
		self.set_state(ConnState::Ready);
		match self.pool() {
			Some(pool) => {
				let wake = PoolRef::new(pool);
				wake.inc_idle();
				self.unlock();
				wake.wake_one();
			},
			None => self.unlock(),
		}
	}

	pub fn add_tx_bytes(&self, n: u64) {
		self.stats.tx_bytes.fetch_add(n, Ordering::Relaxed);
	}

	pub fn add_rx_bytes(&self, n: u64) {
		self.stats.rx_bytes.fetch_add(n, Ordering::Relaxed);
	}

	pub fn retry_attempts(&self) -> u32 {
		self.nr_retry_attempts.load(Ordering::Relaxed)
	}

	pub fn stats(&self) -> ConnStatsSnapshot {
		self.stats.snapshot()
	}

	pub fn snapshot(&self) -> ConnSnapshot {
		ConnSnapshot {
			endpoint: self.endpoint(),
			state: self.state(),
			nr_retry_attempts: self.retry_attempts(),
			stats: self.stats(),
		}
	}
}

/// Bundled per-connection diagnostics, the row form of [`ConnNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnSnapshot {
	pub endpoint: Endpoint,
	pub state: ConnState,
	pub nr_retry_attempts: u32,
	pub stats: ConnStatsSnapshot,
}

#[cfg(test)]
#[path = "node_tests.rs"]
mod tests;
