use crate::archive::{Archive, ArchiveError};
use crate::config::DownloadConfig;
use crate::pipeline::progress::{Outcome, ProgressTracker};
use crate::pipeline::shutdown::Shutdown;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, instrument, warn};

/// Anything instance payloads can be fetched from.
#[async_trait]
pub trait InstanceSource: Send + Sync {
	async fn fetch(&self, instance: &str) -> Result<Bytes, ArchiveError>;
}

#[async_trait]
impl InstanceSource for dyn Archive {
	async fn fetch(&self, instance: &str) -> Result<Bytes, ArchiveError> {
		self.instance_file(instance).await
	}
}

#[derive(Debug, Error)]
pub enum DownloadError {
	#[error("Fetch timed out after {0:?}")]
	Timeout(Duration),
	#[error(transparent)]
	Archive(#[from] ArchiveError),
	#[error("Failed to write {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("Cancelled before the first attempt")]
	Cancelled,
}

/// One instance to download and where it ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDownloadTask {
	pub instance_id: String,
	pub destination: PathBuf,
}

impl InstanceDownloadTask {
	/// The payload is written here first and renamed to the destination once complete.
	pub fn partial_path(&self) -> PathBuf {
		let mut partial = self.destination.clone().into_os_string();
		partial.push(".part");
		PathBuf::from(partial)
	}
}

#[derive(Debug)]
pub enum InstanceOutcome {
	Completed { bytes: usize },
	/// The destination existed before the task started.
	Skipped,
	Failed { error: DownloadError, attempts: u32 },
}

impl InstanceOutcome {
	pub const fn kind(&self) -> Outcome {
		match self {
			Self::Completed { .. } => Outcome::Completed,
			Self::Skipped => Outcome::Skipped,
			Self::Failed { .. } => Outcome::Failed,
		}
	}
}

/// Per-series (or per-accession) tally of instance outcomes.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct DownloadCounts {
	pub completed: usize,
	pub skipped: usize,
	pub failed: usize,
}

impl DownloadCounts {
	pub fn add(&mut self, outcome: Outcome) {
		match outcome {
			Outcome::Completed => self.completed += 1,
			Outcome::Skipped => self.skipped += 1,
			Outcome::Failed => self.failed += 1,
		}
	}

	pub const fn total(&self) -> usize {
		self.completed + self.skipped + self.failed
	}
}

/// Process-wide bound on concurrent fetch-and-write attempts, shared by all series of a run.
#[derive(Debug, Clone)]
pub struct DownloadLimiter {
	semaphore: Arc<Semaphore>,
}

/// A slot of the [`DownloadLimiter`], released on drop.
pub struct DownloadPermit {
	_permit: OwnedSemaphorePermit,
}

impl DownloadLimiter {
	pub fn new(size: usize) -> Self {
		Self {
			semaphore: Arc::new(Semaphore::new(size.max(1))),
		}
	}

	/// Returns `None` only if the limiter was closed.
	pub async fn acquire(&self) -> Option<DownloadPermit> {
		Arc::clone(&self.semaphore)
			.acquire_owned()
			.await
			.ok()
			.map(|permit| DownloadPermit { _permit: permit })
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
	/// Attempts per instance, including the first.
	pub attempts: u32,
	/// Bound of each fetch. Backoff sleeps and file writes are not part of it.
	pub timeout: Duration,
	pub error_backoff: Duration,
	pub timeout_backoff: Duration,
}

impl RetryPolicy {
	/// Linear backoff: the n-th failed attempt waits n times the base of its error kind.
	pub fn backoff(&self, attempt: u32, error: &DownloadError) -> Duration {
		let base = match error {
			DownloadError::Timeout(_) => self.timeout_backoff,
			_ => self.error_backoff,
		};
		base * attempt
	}
}

impl From<&DownloadConfig> for RetryPolicy {
	fn from(config: &DownloadConfig) -> Self {
		Self {
			attempts: config.retries.max(1),
			timeout: Duration::from_millis(config.timeout),
			error_backoff: Duration::from_millis(config.error_backoff),
			timeout_backoff: Duration::from_millis(config.timeout_backoff),
		}
	}
}

/// Downloads instances concurrently, bounded by a shared [`DownloadLimiter`].
pub struct ConcurrentInstanceDownloader<S: ?Sized> {
	source: Arc<S>,
	limiter: DownloadLimiter,
	policy: RetryPolicy,
	shutdown: Shutdown,
}

impl<S: ?Sized> Clone for ConcurrentInstanceDownloader<S> {
	fn clone(&self) -> Self {
		Self {
			source: Arc::clone(&self.source),
			limiter: self.limiter.clone(),
			policy: self.policy,
			shutdown: self.shutdown.clone(),
		}
	}
}

impl<S> ConcurrentInstanceDownloader<S>
where
	S: InstanceSource + ?Sized + 'static,
{
	pub const fn new(
		source: Arc<S>,
		limiter: DownloadLimiter,
		policy: RetryPolicy,
		shutdown: Shutdown,
	) -> Self {
		Self {
			source,
			limiter,
			policy,
			shutdown,
		}
	}

	/// Downloads all `tasks` concurrently and waits until every one of them reported to `tracker`.
	#[instrument(skip_all, fields(series = series, instances = tasks.len()))]
	pub async fn download_series(
		&self,
		series: &str,
		tasks: Vec<InstanceDownloadTask>,
		tracker: &Arc<ProgressTracker>,
	) -> DownloadCounts {
		let mut set = JoinSet::new();
		for task in tasks {
			let downloader = self.clone();
			let tracker = Arc::clone(tracker);
			set.spawn(async move {
				let outcome = downloader.download(&task).await;
				tracker.record(outcome.kind());
				(task, outcome)
			});
		}

		let mut counts = DownloadCounts::default();
		while let Some(joined) = set.join_next().await {
			match joined {
				Ok((task, outcome)) => {
					match &outcome {
						InstanceOutcome::Completed { bytes } => {
							debug!(instance = %task.instance_id, bytes, "Downloaded instance");
						}
						InstanceOutcome::Failed { error, attempts } => error!(
							instance = %task.instance_id,
							attempts, "Failed to download instance: {error}"
						),
						InstanceOutcome::Skipped => {}
					}
					counts.add(outcome.kind());
				}
				Err(err) => {
					// A panicking task never reached the tracker.
					error!("Download task aborted: {err}");
					tracker.record(Outcome::Failed);
					counts.add(Outcome::Failed);
				}
			}
		}
		counts
	}

	/// Downloads a single instance, retrying transient failures. Never returns before the
	/// outcome is final.
	pub async fn download(&self, task: &InstanceDownloadTask) -> InstanceOutcome {
		if fs::try_exists(&task.destination).await.unwrap_or(false) {
			debug!(instance = %task.instance_id, "Instance already present");
			return InstanceOutcome::Skipped;
		}

		if let Some(parent) = task.destination.parent() {
			if let Err(source) = fs::create_dir_all(parent).await {
				return InstanceOutcome::Failed {
					error: DownloadError::Io {
						path: parent.to_owned(),
						source,
					},
					attempts: 0,
				};
			}
		}

		let mut attempt = 0;
		loop {
			let permit = tokio::select! {
				biased;
				() = self.shutdown.triggered(), if attempt == 0 => None,
				permit = self.limiter.acquire() => permit,
			};
			let Some(permit) = permit else {
				return InstanceOutcome::Failed {
					error: DownloadError::Cancelled,
					attempts: attempt,
				};
			};
			attempt += 1;

			let result = self.attempt(task).await;
			drop(permit);

			let error = match result {
				Ok(bytes) => return InstanceOutcome::Completed { bytes },
				Err(error) => error,
			};
			if attempt >= self.policy.attempts || self.shutdown.is_triggered() {
				return InstanceOutcome::Failed {
					error,
					attempts: attempt,
				};
			}

			let delay = self.policy.backoff(attempt, &error);
			warn!(
				instance = %task.instance_id,
				attempt,
				retry_in = delay.as_secs_f64(),
				"Download attempt failed: {error}"
			);
			tokio::time::sleep(delay).await;
		}
	}

	async fn attempt(&self, task: &InstanceDownloadTask) -> Result<usize, DownloadError> {
		let payload = tokio::time::timeout(self.policy.timeout, self.source.fetch(&task.instance_id))
			.await
			.map_err(|_| DownloadError::Timeout(self.policy.timeout))??;

		let partial = task.partial_path();
		fs::write(&partial, &payload)
			.await
			.map_err(|source| DownloadError::Io {
				path: partial.clone(),
				source,
			})?;
		if let Err(source) = fs::rename(&partial, &task.destination).await {
			if let Err(err) = fs::remove_file(&partial).await {
				warn!(path = %partial.display(), "Failed to remove partial file: {err}");
			}
			return Err(DownloadError::Io {
				path: task.destination.clone(),
				source,
			});
		}
		Ok(payload.len())
	}
}
