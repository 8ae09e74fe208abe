use crate::archive::{
	Archive, ArchiveError, JobState, JobStatus, MissingAttribute, MoveMode, MoveRequest,
	ResourceIdentifier,
};
use crate::config::{ArchiveConfig, RetrievalConfig};
use crate::pipeline::shutdown::Shutdown;
use crate::types::{JobId, QueryRetrieveLevel, AE};
use async_stream::stream;
use futures::{pin_mut, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum RetrievalError {
	#[error("Move identifier is missing {0}")]
	MissingIdentifier(#[from] MissingAttribute),
	#[error(transparent)]
	Archive(#[from] ArchiveError),
	#[error("Archive accepted the move but returned no job id")]
	NoJobId,
	#[error(transparent)]
	Job(#[from] JobError),
}

/// Terminal outcomes of a job other than success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
	#[error("Job {job} failed: {detail}")]
	Failed { job: JobId, detail: String },
	#[error("Job {job} did not finish after {attempts} polls")]
	Timeout { job: JobId, attempts: u32 },
	#[error("Stopped waiting for job {job}")]
	Abandoned { job: JobId },
}

/// Moves resources from the remote modality into the archive and follows the resulting jobs.
pub struct RetrievalCoordinator {
	archive: Arc<dyn Archive>,
	modality: String,
	target_aet: AE,
	poll_interval: Duration,
	max_poll_attempts: u32,
	shutdown: Shutdown,
}

impl RetrievalCoordinator {
	pub fn new(
		archive: Arc<dyn Archive>,
		archive_config: &ArchiveConfig,
		config: &RetrievalConfig,
		shutdown: Shutdown,
	) -> Self {
		Self {
			archive,
			modality: archive_config.modality.clone(),
			target_aet: archive_config.target_aet.clone(),
			poll_interval: Duration::from_millis(config.poll_interval),
			max_poll_attempts: config.max_poll_attempts.max(1),
			shutdown,
		}
	}

	/// Validates `identifier` for `level` and submits the move. No request is sent for an
	/// incomplete identifier.
	pub async fn submit(
		&self,
		level: QueryRetrieveLevel,
		identifier: ResourceIdentifier,
		mode: MoveMode,
	) -> Result<Option<JobId>, RetrievalError> {
		identifier.validate(level)?;
		let request = MoveRequest {
			level,
			identifier,
			target_aet: self.target_aet.clone(),
			mode,
		};
		Ok(self.archive.move_resource(&self.modality, &request).await?)
	}

	/// Moves a single instance and blocks until the archive finished the move.
	#[instrument(skip_all, fields(sop = sop_instance_uid))]
	pub async fn retrieve_instance(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
		sop_instance_uid: &str,
	) -> Result<(), RetrievalError> {
		let identifier = ResourceIdentifier::study(study_instance_uid)
			.series(series_instance_uid)
			.instance(sop_instance_uid);
		self.submit(QueryRetrieveLevel::Instance, identifier, MoveMode::Synchronous)
			.await?;
		debug!("Moved sample instance");
		Ok(())
	}

	/// Moves a whole series as an asynchronous job and waits for the job to finish.
	#[instrument(skip_all, fields(series = series_instance_uid))]
	pub async fn retrieve_series(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
	) -> Result<JobId, RetrievalError> {
		let identifier = ResourceIdentifier::study(study_instance_uid).series(series_instance_uid);
		let job = self
			.submit(QueryRetrieveLevel::Series, identifier, MoveMode::Asynchronous)
			.await?
			.ok_or(RetrievalError::NoJobId)?;

		info!(job = %job, "Submitted series retrieval");
		self.wait_for_job(&job).await?;
		info!(job = %job, "Series retrieval finished");
		Ok(job)
	}

	/// Polls `job` every poll interval, at most `max_poll_attempts` times. The first poll happens
	/// right away and the stream ends after the first terminal status.
	pub fn job_updates(&self, job: &str) -> impl Stream<Item = Result<JobStatus, ArchiveError>> {
		let archive = Arc::clone(&self.archive);
		let job = job.to_owned();
		let interval = self.poll_interval;
		let attempts = self.max_poll_attempts;

		stream! {
			for attempt in 0..attempts {
				if attempt > 0 {
					tokio::time::sleep(interval).await;
				}
				let status = archive.job_status(&job).await;
				let terminal = matches!(&status, Ok(status) if status.state.is_terminal());
				yield status;
				if terminal {
					break;
				}
			}
		}
	}

	/// Waits until `job` reaches a terminal state, the poll attempts are exhausted or a
	/// shutdown was requested.
	pub async fn wait_for_job(&self, job: &str) -> Result<(), JobError> {
		let updates = self.job_updates(job);
		pin_mut!(updates);

		loop {
			let update = tokio::select! {
				biased;
				() = self.shutdown.triggered() => {
					return Err(JobError::Abandoned { job: job.to_owned() });
				}
				update = updates.next() => update,
			};

			match update {
				Some(Ok(status)) => {
					debug!(job, state = %status.state, progress = status.progress, "Polled job");
					match status.state {
						JobState::Success => return Ok(()),
						JobState::Failure => {
							return Err(JobError::Failed {
								job: job.to_owned(),
								detail: status
									.error_detail
									.unwrap_or_else(|| String::from("no detail provided")),
							});
						}
						JobState::Pending | JobState::Running => {}
					}
				}
				// A failed poll counts as an attempt, the job itself may still be running.
				Some(Err(err)) => warn!(job, "Failed to poll job status: {err}"),
				None => {
					return Err(JobError::Timeout {
						job: job.to_owned(),
						attempts: self.max_poll_attempts,
					});
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pipeline::testing::{status, FakeArchive, RemoteInstance};
	use tokio::time::Instant;

	fn coordinator(archive: &Arc<FakeArchive>, shutdown: Shutdown) -> RetrievalCoordinator {
		RetrievalCoordinator::new(
			Arc::clone(archive) as Arc<dyn Archive>,
			&ArchiveConfig::default(),
			&RetrievalConfig::default(),
			shutdown,
		)
	}

	fn failure(detail: &str) -> JobStatus {
		JobStatus {
			state: JobState::Failure,
			progress: 50.0,
			error_detail: Some(detail.to_owned()),
		}
	}

	#[tokio::test]
	async fn incomplete_identifier_is_rejected_before_any_request() {
		let archive = Arc::new(FakeArchive::default());
		let coordinator = coordinator(&archive, Shutdown::new());

		let result = coordinator
			.submit(
				QueryRetrieveLevel::Series,
				ResourceIdentifier::study("1.2.3"),
				MoveMode::Asynchronous,
			)
			.await;

		assert!(matches!(
			result,
			Err(RetrievalError::MissingIdentifier(
				MissingAttribute::SeriesInstanceUid
			))
		));
		assert!(archive.state().moves.is_empty());
	}

	#[tokio::test]
	async fn instance_moves_are_synchronous_and_fully_identified() {
		let sample = RemoteInstance::new("ACC1", "LOC", "1", 0, b"loc");
		let archive = Arc::new(FakeArchive::new(vec![sample.clone()]));
		let coordinator = coordinator(&archive, Shutdown::new());

		coordinator
			.retrieve_instance(&sample.study_uid, &sample.series_uid, &sample.sop_uid)
			.await
			.unwrap();

		let state = archive.state();
		assert_eq!(state.moves.len(), 1);
		let request = &state.moves[0];
		assert_eq!(request.mode, MoveMode::Synchronous);
		assert_eq!(request.level, QueryRetrieveLevel::Instance);
		assert_eq!(request.identifier.study_instance_uid, sample.study_uid);
		assert_eq!(request.target_aet, "ORTHANC");
		assert!(state.sops.contains_key(&sample.sop_uid));
	}

	#[tokio::test(start_paused = true)]
	async fn series_job_is_polled_until_success() {
		let instances = RemoteInstance::series("ACC1", "ADC", "5", 3, b"adc");
		let archive = Arc::new(FakeArchive::new(instances.clone()));
		archive.state().job_script = vec![
			status(JobState::Pending),
			status(JobState::Running),
			status(JobState::Success),
		];
		let coordinator = coordinator(&archive, Shutdown::new());

		let started = Instant::now();
		let job = coordinator
			.retrieve_series(&instances[0].study_uid, &instances[0].series_uid)
			.await
			.unwrap();

		assert_eq!(job, "job-0");
		assert_eq!(archive.state().polls, 3);
		assert_eq!(started.elapsed(), Duration::from_secs(4));
		assert_eq!(archive.state().moves[0].mode, MoveMode::Asynchronous);
	}

	#[tokio::test(start_paused = true)]
	async fn failed_job_reports_archive_detail() {
		let instances = RemoteInstance::series("ACC1", "ADC", "5", 1, b"adc");
		let archive = Arc::new(FakeArchive::new(instances.clone()));
		archive.state().job_script = vec![status(JobState::Running), failure("C-MOVE rejected")];
		let coordinator = coordinator(&archive, Shutdown::new());

		let result = coordinator
			.retrieve_series(&instances[0].study_uid, &instances[0].series_uid)
			.await;

		match result {
			Err(RetrievalError::Job(JobError::Failed { job, detail })) => {
				assert_eq!(job, "job-0");
				assert_eq!(detail, "C-MOVE rejected");
			}
			other => panic!("unexpected result {other:?}"),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn polling_gives_up_after_max_attempts() {
		let instances = RemoteInstance::series("ACC1", "ADC", "5", 1, b"adc");
		let archive = Arc::new(FakeArchive::new(instances.clone()));
		archive.state().job_script = vec![status(JobState::Running)];
		let coordinator = RetrievalCoordinator::new(
			Arc::clone(&archive) as Arc<dyn Archive>,
			&ArchiveConfig::default(),
			&RetrievalConfig {
				poll_interval: 2_000,
				max_poll_attempts: 5,
			},
			Shutdown::new(),
		);

		let started = Instant::now();
		let result = coordinator
			.retrieve_series(&instances[0].study_uid, &instances[0].series_uid)
			.await;

		assert!(matches!(
			result,
			Err(RetrievalError::Job(JobError::Timeout { attempts: 5, .. }))
		));
		assert_eq!(archive.state().polls, 5);
		assert_eq!(started.elapsed(), Duration::from_secs(8));
	}

	#[tokio::test(start_paused = true)]
	async fn paused_and_retrying_jobs_time_out_at_the_poll_limit() {
		let instances = RemoteInstance::series("ACC1", "ADC", "5", 1, b"adc");
		let archive = Arc::new(FakeArchive::new(instances.clone()));
		archive.state().job_script = vec![
			status(JobState::from("Paused")),
			status(JobState::from("Retry")),
			status(JobState::from("Paused")),
			status(JobState::from("Retry")),
		];
		let coordinator = RetrievalCoordinator::new(
			Arc::clone(&archive) as Arc<dyn Archive>,
			&ArchiveConfig::default(),
			&RetrievalConfig {
				poll_interval: 1_000,
				max_poll_attempts: 4,
			},
			Shutdown::new(),
		);

		let started = Instant::now();
		let result = coordinator
			.retrieve_series(&instances[0].study_uid, &instances[0].series_uid)
			.await;

		match result {
			Err(RetrievalError::Job(JobError::Timeout { job, attempts })) => {
				assert_eq!(job, "job-0");
				assert_eq!(attempts, 4);
			}
			other => panic!("unexpected result {other:?}"),
		}
		assert_eq!(archive.state().polls, 4);
		assert_eq!(started.elapsed(), Duration::from_secs(3));
	}

	#[tokio::test(start_paused = true)]
	async fn job_updates_end_with_the_terminal_status() {
		let instances = RemoteInstance::series("ACC1", "ADC", "5", 1, b"adc");
		let archive = Arc::new(FakeArchive::new(instances.clone()));
		archive.state().job_script = vec![status(JobState::Running), status(JobState::Success)];
		let coordinator = coordinator(&archive, Shutdown::new());
		coordinator
			.submit(
				QueryRetrieveLevel::Series,
				ResourceIdentifier::study(&instances[0].study_uid).series(&instances[0].series_uid),
				MoveMode::Asynchronous,
			)
			.await
			.unwrap();

		let states: Vec<JobState> = coordinator
			.job_updates("job-0")
			.map(|status| status.unwrap().state)
			.collect()
			.await;

		assert_eq!(states, vec![JobState::Running, JobState::Success]);
		assert_eq!(archive.state().polls, 2);
	}

	#[tokio::test(start_paused = true)]
	async fn shutdown_abandons_the_wait() {
		let instances = RemoteInstance::series("ACC1", "ADC", "5", 1, b"adc");
		let archive = Arc::new(FakeArchive::new(instances.clone()));
		archive.state().job_script = vec![status(JobState::Running)];
		let shutdown = Shutdown::new();
		let coordinator = coordinator(&archive, shutdown.clone());

		let trigger = tokio::spawn(async move {
			tokio::time::sleep(Duration::from_secs(5)).await;
			shutdown.trigger();
		});
		let result = coordinator
			.retrieve_series(&instances[0].study_uid, &instances[0].series_uid)
			.await;
		trigger.await.unwrap();

		assert!(matches!(
			result,
			Err(RetrievalError::Job(JobError::Abandoned { .. }))
		));
		assert!(archive.state().polls < 300);
	}

	#[tokio::test]
	async fn missing_job_id_is_an_error() {
		let instances = RemoteInstance::series("ACC1", "ADC", "5", 1, b"adc");
		let archive = Arc::new(FakeArchive::new(instances.clone()));
		archive.state().omit_job_id = true;
		let coordinator = coordinator(&archive, Shutdown::new());

		let result = coordinator
			.retrieve_series(&instances[0].study_uid, &instances[0].series_uid)
			.await;
		assert!(matches!(result, Err(RetrievalError::NoJobId)));
	}
}
