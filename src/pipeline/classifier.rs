use crate::archive::{Archive, ArchiveError, ArchiveQuery, LocalSeries};
use crate::config::{ClassificationConfig, PerInstanceConfig};
use crate::oracle::{ClassificationOracle, OracleError};
use crate::pipeline::plan::SeriesLabel;
use crate::pipeline::resolver::RemoteSeries;
use crate::pipeline::retrieval::{RetrievalCoordinator, RetrievalError};
use crate::types::{QueryRetrieveLevel, ResourceId, UI};
use bytes::Bytes;
use futures::{stream, StreamExt};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Label of series that have neither a classification nor a description.
const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
	/// The description is a direct download keyword, nothing was sampled.
	DirectMatch,
	/// A sampled instance was classified into a whitelisted series type.
	OracleMatch(String),
	Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
	NotWhitelisted(String),
	/// The oracle had no label for the sample.
	Unclassified,
	WhitelistDisabled,
	NoOracle,
	NoSample,
	SamplingFailed(String),
}

impl Display for RejectReason {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::NotWhitelisted(label) => write!(f, "series type {label} is not whitelisted"),
			Self::Unclassified => f.write_str("oracle returned no series type"),
			Self::WhitelistDisabled => f.write_str("whitelist matching is disabled"),
			Self::NoOracle => f.write_str("no classification oracle configured"),
			Self::NoSample => f.write_str("series has no instance to sample"),
			Self::SamplingFailed(reason) => write!(f, "sampling failed: {reason}"),
		}
	}
}

#[derive(Debug, Error)]
pub enum ClassificationError {
	#[error("Failed to look up the sample instance: {0}")]
	Lookup(#[source] ArchiveError),
	#[error("Failed to retrieve the sample instance: {0}")]
	Retrieval(#[from] RetrievalError),
	#[error("Sample {0} is not in the local store after the move")]
	MissingLocalCopy(UI),
	#[error("Failed to fetch the sample instance: {0}")]
	Fetch(#[source] ArchiveError),
	#[error(transparent)]
	Oracle(#[from] OracleError),
}

/// The outcome of classifying one series.
#[derive(Debug, Clone)]
pub struct Classification {
	pub decision: Decision,
	/// Payload of the sampled instance, kept for naming the study folder.
	pub sample: Option<Bytes>,
}

impl Classification {
	const fn new(decision: Decision, sample: Option<Bytes>) -> Self {
		Self { decision, sample }
	}

	fn rejected(reason: RejectReason) -> Self {
		Self::new(Decision::Rejected(reason), None)
	}

	/// The folder label of a matched series: the oracle's series type, otherwise the
	/// series description.
	pub fn label(&self, description: Option<&str>) -> SeriesLabel {
		match &self.decision {
			Decision::OracleMatch(label) => SeriesLabel::classified(label.clone()),
			Decision::DirectMatch => match non_empty(description) {
				Some(description) => SeriesLabel::classified(description),
				None => SeriesLabel::fallback(UNKNOWN_LABEL),
			},
			Decision::Rejected(_) => {
				SeriesLabel::fallback(non_empty(description).unwrap_or(UNKNOWN_LABEL))
			}
		}
	}
}

fn non_empty(description: Option<&str>) -> Option<&str> {
	description
		.map(str::trim)
		.filter(|description| !description.is_empty())
}

/// Keyword and whitelist rules taken from the configuration.
#[derive(Debug, Clone, Default)]
pub struct ClassificationRules {
	whitelist: HashSet<String>,
	direct_keywords: HashSet<String>,
	enable_whitelist: bool,
	enable_direct_keywords: bool,
	download_all: bool,
}

impl From<&ClassificationConfig> for ClassificationRules {
	fn from(config: &ClassificationConfig) -> Self {
		Self {
			whitelist: config.series_whitelist.iter().cloned().collect(),
			direct_keywords: config.direct_keywords.iter().cloned().collect(),
			enable_whitelist: config.enable_whitelist,
			enable_direct_keywords: config.enable_direct_keywords,
			download_all: config.download_all,
		}
	}
}

impl ClassificationRules {
	pub fn is_direct(&self, description: Option<&str>) -> bool {
		self.download_all
			|| (self.enable_direct_keywords
				&& description.is_some_and(|description| self.direct_keywords.contains(description)))
	}

	pub fn decide(&self, label: Option<String>) -> Decision {
		match label {
			None => Decision::Rejected(RejectReason::Unclassified),
			Some(_) if !self.enable_whitelist => Decision::Rejected(RejectReason::WhitelistDisabled),
			Some(label) if self.whitelist.contains(&label) => Decision::OracleMatch(label),
			Some(label) => Decision::Rejected(RejectReason::NotWhitelisted(label)),
		}
	}
}

/// Which series are split by the labels of their single instances.
#[derive(Debug, Clone, Default)]
pub struct PerInstanceRules {
	enabled: bool,
	trigger_prefixes: Vec<String>,
	concurrency: usize,
}

impl From<&PerInstanceConfig> for PerInstanceRules {
	fn from(config: &PerInstanceConfig) -> Self {
		Self {
			enabled: config.enabled,
			trigger_prefixes: config.trigger_prefixes.clone(),
			concurrency: usize::try_from(config.concurrency).unwrap_or(1).max(1),
		}
	}
}

impl PerInstanceRules {
	pub fn triggers(&self, label: &str) -> bool {
		self.enabled
			&& self
				.trigger_prefixes
				.iter()
				.any(|prefix| label.starts_with(prefix.as_str()))
	}
}

/// Instances of one series that share a label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceGroup {
	pub label: SeriesLabel,
	pub instances: Vec<ResourceId>,
}

/// A label and the sampled payload of a series in the local store.
#[derive(Debug, Clone)]
pub struct LocalLabel {
	pub label: SeriesLabel,
	pub sample: Option<Bytes>,
}

/// Decides which series are worth retrieving.
pub struct SeriesClassifier {
	archive: Arc<dyn Archive>,
	oracle: Option<Arc<dyn ClassificationOracle>>,
	coordinator: Arc<RetrievalCoordinator>,
	modality: String,
	rules: ClassificationRules,
	per_instance: PerInstanceRules,
}

impl SeriesClassifier {
	pub fn new(
		archive: Arc<dyn Archive>,
		oracle: Option<Arc<dyn ClassificationOracle>>,
		coordinator: Arc<RetrievalCoordinator>,
		modality: impl Into<String>,
		rules: ClassificationRules,
	) -> Self {
		Self {
			archive,
			oracle,
			coordinator,
			modality: modality.into(),
			rules,
			per_instance: PerInstanceRules::default(),
		}
	}

	#[must_use]
	pub fn with_per_instance(mut self, rules: PerInstanceRules) -> Self {
		self.per_instance = rules;
		self
	}

	/// Classifies a series that is only on the remote modality. If a sample has to be
	/// retrieved, its local copy is deleted again whatever the outcome.
	#[instrument(skip_all, fields(series = %series.series_instance_uid))]
	pub async fn classify_remote(&self, series: &RemoteSeries) -> Classification {
		if self.rules.is_direct(series.description.as_deref()) {
			debug!("Series matches a direct download keyword");
			return Classification::new(Decision::DirectMatch, None);
		}
		let Some(oracle) = &self.oracle else {
			return Classification::rejected(RejectReason::NoOracle);
		};

		match self.sample_remote(series, oracle.as_ref()).await {
			Ok(Some((label, sample))) => Classification::new(self.rules.decide(label), Some(sample)),
			Ok(None) => Classification::rejected(RejectReason::NoSample),
			Err(err) => {
				warn!("Failed to classify series: {err}");
				Classification::rejected(RejectReason::SamplingFailed(err.to_string()))
			}
		}
	}

	/// Classifies a remote series whose instances are already in the local store, using its
	/// first local instance. Nothing is moved or deleted.
	#[instrument(skip_all, fields(series = %series.id))]
	pub async fn classify_stored(&self, series: &LocalSeries) -> Classification {
		if self.rules.is_direct(series.tags.series_description.as_deref()) {
			return Classification::new(Decision::DirectMatch, None);
		}
		let Some(oracle) = &self.oracle else {
			return Classification::rejected(RejectReason::NoOracle);
		};
		let Some(instance) = series.instances.first() else {
			return Classification::rejected(RejectReason::NoSample);
		};

		match self.classify_instance(oracle.as_ref(), instance).await {
			Ok((label, sample)) => Classification::new(self.rules.decide(label), Some(sample)),
			Err(err) => {
				warn!("Failed to classify stored series: {err}");
				Classification::rejected(RejectReason::SamplingFailed(err.to_string()))
			}
		}
	}

	/// Labels a series for a download from the local store. Falls back to the series
	/// description when there is no oracle or it has no answer. The first instance is
	/// fetched when classifying or when `want_sample` is set.
	#[instrument(skip_all, fields(series = %series.id))]
	pub async fn label_local(&self, series: &LocalSeries, want_sample: bool) -> LocalLabel {
		let fallback = SeriesLabel::fallback(
			non_empty(series.tags.series_description.as_deref()).unwrap_or(UNKNOWN_LABEL),
		);
		let Some(instance) = series.instances.first() else {
			return LocalLabel {
				label: fallback,
				sample: None,
			};
		};

		match &self.oracle {
			Some(oracle) => match self.classify_instance(oracle.as_ref(), instance).await {
				Ok((Some(label), sample)) => LocalLabel {
					label: SeriesLabel::classified(label),
					sample: Some(sample),
				},
				Ok((None, sample)) => LocalLabel {
					label: fallback,
					sample: Some(sample),
				},
				Err(err) => {
					warn!("Failed to classify local series: {err}");
					LocalLabel {
						label: fallback,
						sample: None,
					}
				}
			},
			None if want_sample => {
				let sample = match self.archive.instance_file(instance).await {
					Ok(sample) => Some(sample),
					Err(err) => {
						warn!("Failed to fetch sample instance: {err}");
						None
					}
				};
				LocalLabel {
					label: fallback,
					sample,
				}
			}
			None => LocalLabel {
				label: fallback,
				sample: None,
			},
		}
	}

	/// Classifies every instance of a stored series and groups the instances by label, in
	/// order of first appearance. `None` unless `label` triggers per-instance analysis and an
	/// oracle is configured. Instances without a label end up in an `Unknown` group.
	#[instrument(skip_all, fields(series = %series.id, label = %label.text))]
	pub async fn split_by_instance(
		&self,
		series: &LocalSeries,
		label: &SeriesLabel,
	) -> Option<Vec<InstanceGroup>> {
		if !self.per_instance.triggers(&label.text) {
			return None;
		}
		let oracle = self.oracle.as_deref()?;
		info!(instances = series.instances.len(), "Classifying every instance of the series");

		let labels: Vec<(ResourceId, Option<String>)> = stream::iter(&series.instances)
			.map(|instance| async move {
				let label = match self.classify_instance(oracle, instance).await {
					Ok((label, _)) => label,
					Err(err) => {
						warn!(instance = %instance, "Failed to classify instance: {err}");
						None
					}
				};
				(instance.clone(), label)
			})
			.buffered(self.per_instance.concurrency)
			.collect()
			.await;

		let mut groups: Vec<InstanceGroup> = Vec::new();
		for (instance, label) in labels {
			let label = label.map_or_else(|| SeriesLabel::fallback(UNKNOWN_LABEL), SeriesLabel::classified);
			match groups.iter_mut().find(|group| group.label == label) {
				Some(group) => group.instances.push(instance),
				None => groups.push(InstanceGroup {
					label,
					instances: vec![instance],
				}),
			}
		}
		debug!(groups = groups.len(), "Grouped instances by label");
		Some(groups)
	}

	/// Moves the first instance of `series` into the local store, classifies it and deletes
	/// the local copy. `None` if the modality has no instance for the series.
	async fn sample_remote(
		&self,
		series: &RemoteSeries,
		oracle: &dyn ClassificationOracle,
	) -> Result<Option<(Option<String>, Bytes)>, ClassificationError> {
		let query = ArchiveQuery::new(QueryRetrieveLevel::Instance)
			.matching("StudyInstanceUID", series.study_instance_uid.as_str())
			.matching("SeriesInstanceUID", series.series_instance_uid.as_str())
			.matching("SOPInstanceUID", "")
			.limit(1);
		let answers = self
			.archive
			.query_all(&self.modality, &query)
			.await
			.map_err(ClassificationError::Lookup)?;
		let Some(sop) = answers.first().and_then(|answer| answer.sop_instance_uid()) else {
			return Ok(None);
		};

		let moved = self
			.coordinator
			.retrieve_instance(&series.study_instance_uid, &series.series_instance_uid, &sop)
			.await;

		// A failed move may still have stored the instance, so look for it either way.
		let local =
			ArchiveQuery::new(QueryRetrieveLevel::Instance).matching("SOPInstanceUID", sop.as_str());
		let local = match self.archive.find(&local).await {
			Ok(found) => found.into_iter().next(),
			Err(err) => {
				moved?;
				return Err(ClassificationError::Lookup(err));
			}
		};
		let Some(local) = local else {
			moved?;
			return Err(ClassificationError::MissingLocalCopy(sop));
		};

		let result = match moved {
			Ok(()) => self.classify_instance(oracle, &local).await,
			Err(err) => Err(err.into()),
		};
		if let Err(err) = self.archive.delete_instance(&local).await {
			warn!(instance = %local, "Failed to delete sample instance: {err}");
		}
		result.map(Some)
	}

	async fn classify_instance(
		&self,
		oracle: &dyn ClassificationOracle,
		instance: &str,
	) -> Result<(Option<String>, Bytes), ClassificationError> {
		let sample = self
			.archive
			.instance_file(instance)
			.await
			.map_err(ClassificationError::Fetch)?;
		let label = oracle.classify(sample.clone()).await?;
		debug!(instance, label = label.as_deref(), "Classified sample");
		Ok((label, sample))
	}
}
