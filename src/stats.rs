use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;
use serde::Serialize;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

// Monotonic microseconds; the unit every latency counter is kept in.
pub(crate) fn now_us() -> u64 {
	EPOCH.elapsed().as_micros() as u64
}

pub(crate) fn div_safe(total: u64, count: u64) -> u64 {
	if count == 0 { 0 } else { total / count }
}

/// The operation a connection was claimed for; selects which latency
/// bucket the release accounts into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnOp {
	Get,
	Put,
}

// Updated without the conn lock, so everything is a plain atomic counter.
#[derive(Debug, Default)]
pub(crate) struct ConnStats {
	pub nr_lookups: AtomicU64,
	pub tot_us_get: AtomicU64,
	pub tot_us_put: AtomicU64,
	pub tot_us_wait: AtomicU64,
	pub tx_bytes: AtomicU64,
	pub rx_bytes: AtomicU64,
}

impl ConnStats {
	pub fn snapshot(&self) -> ConnStatsSnapshot {
		ConnStatsSnapshot {
			nr_lookups: self.nr_lookups.load(Ordering::Relaxed),
			tot_us_get: self.tot_us_get.load(Ordering::Relaxed),
			tot_us_put: self.tot_us_put.load(Ordering::Relaxed),
			tot_us_wait: self.tot_us_wait.load(Ordering::Relaxed),
			tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
			rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnStatsSnapshot {
	pub nr_lookups: u64,
	pub tot_us_get: u64,
	pub tot_us_put: u64,
	pub tot_us_wait: u64,
	pub tx_bytes: u64,
	pub rx_bytes: u64,
}
