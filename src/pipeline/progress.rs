use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Emit a progress line every this many processed instances.
const EMIT_EVERY: usize = 10;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
	Completed,
	Failed,
	Skipped,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
struct Counters {
	completed: usize,
	failed: usize,
	skipped: usize,
}

/// A consistent view of the counters at one point in time.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ProgressSnapshot {
	pub total: usize,
	pub completed: usize,
	pub failed: usize,
	pub skipped: usize,
	pub elapsed: Duration,
}

impl ProgressSnapshot {
	pub const fn processed(&self) -> usize {
		self.completed + self.failed + self.skipped
	}

	pub const fn remaining(&self) -> usize {
		self.total.saturating_sub(self.processed())
	}

	/// Processed instances per second.
	pub fn throughput(&self) -> f64 {
		let elapsed = self.elapsed.as_secs_f64();
		if elapsed > 0.0 {
			self.processed() as f64 / elapsed
		} else {
			0.0
		}
	}

	/// Estimated time until all instances are processed, `None` while the throughput is zero.
	pub fn eta(&self) -> Option<Duration> {
		let throughput = self.throughput();
		(throughput > 0.0).then(|| Duration::from_secs_f64(self.remaining() as f64 / throughput))
	}
}

/// Aggregates the outcome of every download task of a run.
///
/// The total is fixed on construction. Every task reports exactly once through [`Self::record`],
/// so `completed + failed + skipped == total` once all tasks resolved.
#[derive(Debug)]
pub struct ProgressTracker {
	total: usize,
	started: Instant,
	counters: Mutex<Counters>,
}

impl ProgressTracker {
	pub fn new(total: usize) -> Self {
		Self {
			total,
			started: Instant::now(),
			counters: Mutex::new(Counters::default()),
		}
	}

	/// Counts one terminal outcome and returns the snapshot taken under the same lock.
	pub fn record(&self, outcome: Outcome) -> ProgressSnapshot {
		let snapshot = {
			let mut counters = self
				.counters
				.lock()
				.unwrap_or_else(PoisonError::into_inner);
			match outcome {
				Outcome::Completed => counters.completed += 1,
				Outcome::Failed => counters.failed += 1,
				Outcome::Skipped => counters.skipped += 1,
			}
			self.snapshot_of(*counters)
		};

		let processed = snapshot.processed();
		if processed % EMIT_EVERY == 0 || processed == self.total {
			emit(&snapshot);
		}
		snapshot
	}

	pub fn snapshot(&self) -> ProgressSnapshot {
		let counters = *self
			.counters
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		self.snapshot_of(counters)
	}

	fn snapshot_of(&self, counters: Counters) -> ProgressSnapshot {
		ProgressSnapshot {
			total: self.total,
			completed: counters.completed,
			failed: counters.failed,
			skipped: counters.skipped,
			elapsed: self.started.elapsed(),
		}
	}
}

fn emit(snapshot: &ProgressSnapshot) {
	let eta = snapshot
		.eta()
		.map_or_else(|| String::from("-"), |eta| format!("{}s", eta.as_secs()));
	info!(
		processed = snapshot.processed(),
		total = snapshot.total,
		completed = snapshot.completed,
		skipped = snapshot.skipped,
		failed = snapshot.failed,
		"Progress {}/{} ({:.1} instances/s, ETA {eta})",
		snapshot.processed(),
		snapshot.total,
		snapshot.throughput(),
	);
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;

	#[tokio::test(start_paused = true)]
	async fn throughput_and_eta_follow_elapsed_time() {
		let tracker = ProgressTracker::new(20);
		tokio::time::advance(Duration::from_secs(5)).await;
		for _ in 0..10 {
			tracker.record(Outcome::Completed);
		}

		let snapshot = tracker.snapshot();
		assert_eq!(snapshot.processed(), 10);
		assert_eq!(snapshot.remaining(), 10);
		assert!((snapshot.throughput() - 2.0).abs() < f64::EPSILON);
		assert_eq!(snapshot.eta(), Some(Duration::from_secs(5)));
	}

	#[tokio::test(start_paused = true)]
	async fn eta_is_undefined_without_progress() {
		let tracker = ProgressTracker::new(3);
		let snapshot = tracker.snapshot();
		assert_eq!(snapshot.throughput(), 0.0);
		assert_eq!(snapshot.eta(), None);
	}

	#[test]
	fn concurrent_records_are_conserved() {
		let tracker = Arc::new(ProgressTracker::new(300));
		let handles: Vec<_> = [Outcome::Completed, Outcome::Failed, Outcome::Skipped]
			.into_iter()
			.map(|outcome| {
				let tracker = Arc::clone(&tracker);
				std::thread::spawn(move || {
					for _ in 0..100 {
						let snapshot = tracker.record(outcome);
						assert!(snapshot.processed() <= snapshot.total);
					}
				})
			})
			.collect();
		for handle in handles {
			handle.join().unwrap();
		}

		let snapshot = tracker.snapshot();
		assert_eq!(snapshot.completed, 100);
		assert_eq!(snapshot.failed, 100);
		assert_eq!(snapshot.skipped, 100);
		assert_eq!(snapshot.remaining(), 0);
	}
}
