//! The accession-driven retrieval and download flow.

pub mod classifier;
pub mod download;
pub mod plan;
pub mod progress;
pub mod resolver;
pub mod retrieval;
pub mod shutdown;
#[cfg(test)]
pub(crate) mod testing;

use crate::accession::{AccessionList, AccessionRequest};
use crate::archive::{Archive, ArchiveError, LocalSeries};
use crate::config::AppConfig;
use crate::convert::NiftiConverter;
use crate::oracle::ClassificationOracle;
use crate::pipeline::classifier::{
	ClassificationRules, Decision, PerInstanceRules, RejectReason, SeriesClassifier,
};
use crate::pipeline::download::{
	ConcurrentInstanceDownloader, DownloadCounts, DownloadLimiter, RetryPolicy,
};
use crate::pipeline::plan::{DownloadPlanBuilder, LocalPlanEntry, PlannedSeries, SeriesLabel};
use crate::pipeline::progress::ProgressTracker;
use crate::pipeline::resolver::{AccessionResolver, RemoteSeries, RemoteStudy};
use crate::pipeline::retrieval::RetrievalCoordinator;
use crate::pipeline::shutdown::Shutdown;
use crate::report::{AccessionReport, RunSummary};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunMode {
	/// Classify and retrieve from the remote modality, then download.
	Remote,
	/// Download what the archive already stores.
	Local,
}

/// What a run produced.
#[derive(Debug)]
pub struct RunOutcome {
	pub reports: Vec<AccessionReport>,
	pub summary: RunSummary,
}

/// Plans of one accession, waiting for the download phase.
struct AccessionPlan {
	report: AccessionReport,
	studies: Vec<LocalPlanEntry>,
	resolved: bool,
}

pub struct Pipeline {
	archive: Arc<dyn Archive>,
	resolver: AccessionResolver,
	classifier: SeriesClassifier,
	coordinator: Arc<RetrievalCoordinator>,
	planner: DownloadPlanBuilder,
	downloader: ConcurrentInstanceDownloader<dyn Archive>,
	converter: Option<NiftiConverter>,
	output: PathBuf,
	shutdown: Shutdown,
	run_id: Uuid,
}

impl Pipeline {
	pub fn new(
		config: &AppConfig,
		archive: Arc<dyn Archive>,
		oracle: Option<Arc<dyn ClassificationOracle>>,
		shutdown: Shutdown,
	) -> Self {
		let coordinator = Arc::new(RetrievalCoordinator::new(
			Arc::clone(&archive),
			&config.archive,
			&config.retrieval,
			shutdown.clone(),
		));
		let classifier = SeriesClassifier::new(
			Arc::clone(&archive),
			oracle,
			Arc::clone(&coordinator),
			config.archive.modality.clone(),
			ClassificationRules::from(&config.classification),
		)
		.with_per_instance(PerInstanceRules::from(&config.per_instance));
		let limiter = DownloadLimiter::new(
			usize::try_from(config.download.concurrency).unwrap_or(usize::MAX),
		);
		let downloader = ConcurrentInstanceDownloader::new(
			Arc::clone(&archive),
			limiter,
			RetryPolicy::from(&config.download),
			shutdown.clone(),
		);

		Self {
			resolver: AccessionResolver::new(Arc::clone(&archive), config.archive.modality.clone()),
			archive,
			classifier,
			coordinator,
			planner: DownloadPlanBuilder::new(&config.classification),
			downloader,
			converter: config
				.conversion
				.enabled
				.then(|| NiftiConverter::new(&config.conversion)),
			output: config.download.output.clone(),
			shutdown,
			run_id: Uuid::new_v4(),
		}
	}

	/// Plans every accession first, then downloads all planned instances under one progress
	/// tracker. Failures of single accessions, series or instances end up in the reports.
	pub async fn run(&self, mode: RunMode, accessions: &AccessionList) -> RunOutcome {
		let started = Instant::now();
		info!(run = %self.run_id, accessions = accessions.len(), ?mode, "Starting run");

		let mut plans = Vec::with_capacity(accessions.len());
		for accession in accessions {
			let mut report = AccessionReport::new(self.run_id, accession);
			if self.shutdown.is_triggered() {
				report.reason("run was interrupted");
				plans.push(unresolved(report));
				continue;
			}
			let plan = match mode {
				RunMode::Remote => self.plan_remote(accession, report).await,
				RunMode::Local => self.plan_local(accession, report).await,
			};
			plans.push(plan);
		}

		let total: usize = plans
			.iter()
			.flat_map(|plan| &plan.studies)
			.map(LocalPlanEntry::instance_count)
			.sum();
		info!(instances = total, "Planned downloads");
		let tracker = Arc::new(ProgressTracker::new(total));

		let mut summary = RunSummary {
			accessions: accessions.len(),
			..RunSummary::default()
		};
		let mut reports = Vec::with_capacity(plans.len());
		for mut plan in plans {
			for study in &plan.studies {
				let mut downloaded: Vec<&str> = Vec::new();
				for (series, tasks) in study.tasks(&self.output) {
					let counts = self
						.downloader
						.download_series(&series.series_id, tasks, &tracker)
						.await;
					if counts.failed > 0 {
						plan.report.reason(format!(
							"{} instance(s) of {}/{} failed to download",
							counts.failed, study.study_folder, series.folder
						));
						plan.report.failed_series.push(series.folder.clone());
					}
					plan.report.add_counts(counts);
					if counts.completed + counts.skipped > 0
						&& !downloaded.contains(&series.folder.as_str())
					{
						downloaded.push(&series.folder);
					}
				}
				if let Some(converter) = &self.converter {
					self.convert_study(converter, study, &downloaded, &mut plan.report)
						.await;
				}
			}
			if plan.resolved {
				summary.resolved += 1;
			}
			plan.report.finish();
			reports.push(plan.report);
		}

		let progress = tracker.snapshot();
		summary.counts = DownloadCounts {
			completed: progress.completed,
			skipped: progress.skipped,
			failed: progress.failed,
		};
		summary.elapsed = started.elapsed();
		summary.log();
		debug!(
			instances_per_sec = progress.throughput(),
			"Download throughput"
		);
		RunOutcome { reports, summary }
	}

	#[instrument(skip_all, fields(accession = %accession))]
	async fn plan_remote(
		&self,
		accession: &AccessionRequest,
		mut report: AccessionReport,
	) -> AccessionPlan {
		let studies = match self.resolver.resolve_remote(accession).await {
			Ok(studies) => studies,
			Err(err) => {
				error!("Failed to query the remote modality: {err}");
				report.reason(format!("remote query failed: {err}"));
				return unresolved(report);
			}
		};
		if studies.is_empty() {
			warn!("No study found on the remote modality");
			report.reason("no study found on the remote modality");
			return unresolved(report);
		}

		let mut entries = Vec::new();
		for study in &studies {
			if self.shutdown.is_triggered() {
				report.reason("run was interrupted");
				break;
			}
			match self.plan_remote_study(accession, study, &mut report).await {
				Ok(Some(entry)) => entries.push(entry),
				Ok(None) => {}
				Err(err) => {
					error!(study = %study.study_instance_uid, "Failed to plan study: {err}");
					report.reason(format!("study {}: {err}", study.study_instance_uid));
				}
			}
		}

		AccessionPlan {
			report,
			studies: entries,
			resolved: true,
		}
	}

	#[instrument(skip_all, fields(study = %study.study_instance_uid))]
	async fn plan_remote_study(
		&self,
		accession: &AccessionRequest,
		study: &RemoteStudy,
		report: &mut AccessionReport,
	) -> Result<Option<LocalPlanEntry>, ArchiveError> {
		let series = self.resolver.remote_series(study).await?;
		info!(series = series.len(), "Classifying series");

		let mut sample: Option<Bytes> = None;
		let mut planned = Vec::new();
		for remote in &series {
			if self.shutdown.is_triggered() {
				report.reason("run was interrupted");
				break;
			}
			let name = series_name(remote);

			let stored = self.stored_series(&remote.series_instance_uid).await;
			let classification = match &stored {
				Some(local) => self.classifier.classify_stored(local).await,
				None => self.classifier.classify_remote(remote).await,
			};
			if sample.is_none() {
				sample.clone_from(&classification.sample);
			}

			if let Decision::Rejected(reason) = &classification.decision {
				if matches!(reason, RejectReason::SamplingFailed(_)) {
					report.reason(format!("series {name}: {reason}"));
				} else {
					info!(series = %name, "Skipping series: {reason}");
				}
				continue;
			}

			let label = classification.label(remote.description.as_deref());
			report.matched_series.push(label.text.clone());

			let complete = match &stored {
				Some(local) => self.stored_completely(remote, local).await,
				None => false,
			};
			let local = match stored {
				Some(local) if complete => {
					debug!(series = %name, "Series is already stored locally");
					local
				}
				_ => {
					if let Err(err) = self
						.coordinator
						.retrieve_series(&study.study_instance_uid, &remote.series_instance_uid)
						.await
					{
						error!(series = %name, "Failed to retrieve series: {err}");
						report.reason(format!("series {name}: {err}"));
						report.failed_series.push(label.text);
						continue;
					}
					report.retrieved_series.push(label.text.clone());

					let Some(local) = self.stored_series(&remote.series_instance_uid).await else {
						warn!(series = %name, "Retrieved series is not in the local store");
						report.reason(format!("series {name}: not in the local store after retrieval"));
						report.failed_series.push(label.text);
						continue;
					};
					local
				}
			};

			planned.extend(self.planned_series(local, label, remote.number.clone()).await);
		}

		if planned.is_empty() {
			info!("No series of the study is going to be downloaded");
			return Ok(None);
		}

		let study_id = self
			.resolver
			.local_study(&study.study_instance_uid)
			.await?
			.map_or_else(|| study.study_instance_uid.clone(), |local| local.id);
		let folder = self
			.planner
			.study_folder(accession.as_str(), &study_id, sample.as_deref());
		Ok(Some(self.planner.build(folder, planned)))
	}

	/// Whether the local store holds as many instances as the modality reports for `remote`.
	/// A count that cannot be determined counts as incomplete.
	async fn stored_completely(&self, remote: &RemoteSeries, local: &LocalSeries) -> bool {
		match self.resolver.remote_instance_count(remote).await {
			Ok(expected) if local.instances.len() >= expected => true,
			Ok(expected) => {
				info!(
					series = %series_name(remote),
					stored = local.instances.len(),
					expected,
					"Local copy is incomplete, retrieving the series again"
				);
				false
			}
			Err(err) => {
				warn!(series = %series_name(remote), "Failed to count remote instances: {err}");
				false
			}
		}
	}

	/// `local` as one planned series, or one per instance label if per-instance analysis
	/// applies to `label`.
	async fn planned_series(
		&self,
		local: LocalSeries,
		label: SeriesLabel,
		number: Option<String>,
	) -> Vec<PlannedSeries> {
		let groups = self.classifier.split_by_instance(&local, &label).await;
		match groups {
			Some(groups) => groups
				.into_iter()
				.map(|group| PlannedSeries {
					series_id: local.id.clone(),
					label: group.label,
					number: number.clone(),
					instances: group.instances,
				})
				.collect(),
			None => vec![PlannedSeries {
				series_id: local.id,
				label,
				number,
				instances: local.instances,
			}],
		}
	}

	/// Converts each downloaded series folder of `study` once. Failures become reasons.
	async fn convert_study(
		&self,
		converter: &NiftiConverter,
		study: &LocalPlanEntry,
		folders: &[&str],
		report: &mut AccessionReport,
	) {
		if self.shutdown.is_triggered() {
			info!(study = %study.study_folder, "Skipping conversion after shutdown");
			return;
		}
		for &folder in folders {
			let series_dir = self.output.join(&study.study_folder).join(folder);
			match converter
				.convert_series(&series_dir, &study.study_folder, folder)
				.await
			{
				Ok(_) => report.converted_series.push(folder.to_owned()),
				Err(err) => {
					error!(study = %study.study_folder, series = folder, "Failed to convert series: {err}");
					report.reason(format!(
						"conversion of {}/{folder} failed: {err}",
						study.study_folder
					));
					report.conversion_failed.push(folder.to_owned());
				}
			}
		}
	}

	/// The local record of a series, if the archive stores instances of it. Lookup failures
	/// are logged and treated as absent.
	async fn stored_series(&self, series_instance_uid: &str) -> Option<LocalSeries> {
		let lookup = async {
			let Some(id) = self.resolver.local_series_id(series_instance_uid).await? else {
				return Ok(None);
			};
			self.archive.series(&id).await.map(Some)
		};
		match lookup.await {
			Ok(series) => series.filter(|series| !series.instances.is_empty()),
			Err(err) => {
				warn!(series = series_instance_uid, "Failed to look up local series: {err}");
				None
			}
		}
	}

	#[instrument(skip_all, fields(accession = %accession))]
	async fn plan_local(
		&self,
		accession: &AccessionRequest,
		mut report: AccessionReport,
	) -> AccessionPlan {
		let studies = match self.resolver.resolve_local(accession).await {
			Ok(studies) => studies,
			Err(err) => {
				error!("Failed to query the local store: {err}");
				report.reason(format!("local query failed: {err}"));
				return unresolved(report);
			}
		};
		if studies.is_empty() {
			warn!("No study found in the local store");
			report.reason("no study found in the local store");
			return unresolved(report);
		}

		let mut entries = Vec::new();
		for study in &studies {
			if self.shutdown.is_triggered() {
				report.reason("run was interrupted");
				break;
			}
			let series = match self.resolver.local_series(study).await {
				Ok(series) => series,
				Err(err) => {
					error!(study = %study.id, "Failed to list series: {err}");
					report.reason(format!("study {}: {err}", study.id));
					continue;
				}
			};

			let mut sample: Option<Bytes> = None;
			let mut planned = Vec::new();
			for series in series {
				if series.instances.is_empty() {
					continue;
				}
				let labelled = self.classifier.label_local(&series, sample.is_none()).await;
				if sample.is_none() {
					sample = labelled.sample;
				}
				report.matched_series.push(labelled.label.text.clone());
				let number = series.tags.series_number.clone();
				planned.extend(self.planned_series(series, labelled.label, number).await);
			}

			let folder = self
				.planner
				.study_folder(accession.as_str(), &study.id, sample.as_deref());
			let entry = self.planner.build(folder, planned);
			if !entry.series.is_empty() {
				entries.push(entry);
			}
		}

		AccessionPlan {
			report,
			studies: entries,
			resolved: true,
		}
	}
}

const fn unresolved(report: AccessionReport) -> AccessionPlan {
	AccessionPlan {
		report,
		studies: Vec::new(),
		resolved: false,
	}
}

fn series_name(series: &RemoteSeries) -> String {
	series
		.description
		.as_deref()
		.filter(|description| !description.trim().is_empty())
		.map_or_else(|| series.series_instance_uid.clone(), str::to_owned)
}
