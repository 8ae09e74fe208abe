use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative cancellation shared by every stage of a run.
///
/// Once triggered, no new accession, series, job or download attempt is started. Work that is
/// already in flight is left to finish or time out.
#[derive(Debug, Clone)]
pub struct Shutdown {
	sender: Arc<watch::Sender<bool>>,
	receiver: watch::Receiver<bool>,
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

impl Shutdown {
	pub fn new() -> Self {
		let (sender, receiver) = watch::channel(false);
		Self {
			sender: Arc::new(sender),
			receiver,
		}
	}

	pub fn trigger(&self) {
		self.sender.send_replace(true);
	}

	pub fn is_triggered(&self) -> bool {
		*self.receiver.borrow()
	}

	/// Resolves once [`Self::trigger`] was called.
	pub async fn triggered(&self) {
		let mut receiver = self.receiver.clone();
		if receiver.wait_for(|triggered| *triggered).await.is_err() {
			std::future::pending::<()>().await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test]
	async fn clones_observe_trigger() {
		let shutdown = Shutdown::new();
		let observer = shutdown.clone();
		assert!(!observer.is_triggered());

		let waiter = tokio::spawn(async move { observer.triggered().await });
		shutdown.trigger();

		tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.unwrap()
			.unwrap();
		assert!(shutdown.is_triggered());
	}
}
