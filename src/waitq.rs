use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};

/// One-at-a-time wakeups over a predicate. `notify_one` stores a permit
/// when no waiter is registered yet, so a wake issued between the
/// predicate check and the first poll of the sleep future is not lost.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
	notify: Notify,
	waiters: AtomicUsize,
}

impl WaitQueue {
	pub fn has_waiters(&self) -> bool {
		self.waiters.load(Ordering::SeqCst) > 0
	}

	/// Wake a single waiter, never the whole queue.
	pub fn wake_one(&self) {
		if self.has_waiters() {
			self.notify.notify_one();
		}
	}

	/// Suspend until `ready()` holds or the deadline passes. The return
	/// value is the predicate's value at the time the wait ended, so a
	/// timeout that races a wake still reports the usable state.
	pub async fn wait_until(&self, deadline: Instant, ready: impl Fn() -> bool) -> bool {
		loop {
			let notified = self.notify.notified();
			tokio::pin!(notified);
			// Registered before the predicate check: a waker that saw the
			// gauge at zero must have published the state this check reads.
			let _waiting = Waiting::register(self);
			if ready() {
				return true;
			}
			if timeout_at(deadline, notified).await.is_err() {
				return ready();
			}
			if ready() {
				return true;
			}
		}
	}
}

struct Waiting<'a>(&'a WaitQueue);

impl<'a> Waiting<'a> {
	fn register(wq: &'a WaitQueue) -> Self {
		wq.waiters.fetch_add(1, Ordering::SeqCst);
		Self(wq)
	}
}

impl Drop for Waiting<'_> {
	fn drop(&mut self) {
		self.0.waiters.fetch_sub(1, Ordering::SeqCst);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use tokio::time::Instant;

	use super::WaitQueue;

	#[tokio::test(start_paused = true)]
	async fn test_times_out_when_never_ready() {
		let wq = WaitQueue::default();
		let woke = wq
			.wait_until(Instant::now() + Duration::from_millis(5), || false)
			.await;
		assert!(!woke);
		assert!(!wq.has_waiters());
	}

	#[tokio::test]
	async fn test_returns_immediately_when_ready() {
		let wq = WaitQueue::default();
		let woke = wq
			.wait_until(Instant::now() + Duration::from_secs(1), || true)
			.await;
		assert!(woke);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_spurious_wake_goes_back_to_sleep() {
		let wq = Arc::new(WaitQueue::default());
		let flag = Arc::new(AtomicUsize::new(0));
		let waiter = tokio::spawn({
			let wq = wq.clone();
			let flag = flag.clone();
			async move {
				wq.wait_until(Instant::now() + Duration::from_secs(5), || {
					flag.load(Ordering::SeqCst) > 0
				})
				.await
			}
		});
		while !wq.has_waiters() {
			tokio::time::sleep(Duration::from_millis(2)).await;
		}

		// wake without the predicate: the waiter must re-sleep
		wq.wake_one();
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert!(!waiter.is_finished());

		flag.store(1, Ordering::SeqCst);
		wq.wake_one();
		assert!(waiter.await.unwrap());
		assert!(!wq.has_waiters());
	}
}
