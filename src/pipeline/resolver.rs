use crate::accession::AccessionRequest;
use crate::archive::{Archive, ArchiveError, ArchiveQuery, LocalSeries, LocalStudy};
use crate::types::{QueryRetrieveLevel, ResourceId, UI};
use dicom::dictionary_std::tags;
use futures::{stream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// A study found on the remote modality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStudy {
	pub study_instance_uid: UI,
	pub accession_number: String,
	pub patient_id: Option<String>,
	pub study_date: Option<String>,
	pub modality: Option<String>,
}

/// A series of a [`RemoteStudy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSeries {
	pub study_instance_uid: UI,
	pub series_instance_uid: UI,
	pub description: Option<String>,
	pub number: Option<String>,
	/// NumberOfSeriesRelatedInstances as reported by the modality.
	pub instance_count: Option<usize>,
}

/// Looks up studies by accession number, remotely or in the archive's own store.
pub struct AccessionResolver {
	archive: Arc<dyn Archive>,
	modality: String,
}

impl AccessionResolver {
	pub fn new(archive: Arc<dyn Archive>, modality: impl Into<String>) -> Self {
		Self {
			archive,
			modality: modality.into(),
		}
	}

	/// Queries the remote modality for studies with `accession`. Answers without a
	/// StudyInstanceUID cannot be retrieved and are dropped.
	#[instrument(skip_all, fields(accession = %accession))]
	pub async fn resolve_remote(
		&self,
		accession: &AccessionRequest,
	) -> Result<Vec<RemoteStudy>, ArchiveError> {
		let query = ArchiveQuery::new(QueryRetrieveLevel::Study)
			.matching("AccessionNumber", accession.as_str())
			.matching("StudyInstanceUID", "")
			.matching("PatientID", "")
			.matching("StudyDate", "")
			.matching("ModalitiesInStudy", "");
		let answers = self.archive.query_all(&self.modality, &query).await?;

		let studies: Vec<RemoteStudy> = answers
			.into_iter()
			.filter_map(|answer| {
				let Some(study_instance_uid) = answer.study_instance_uid() else {
					warn!("Ignoring study answer without StudyInstanceUID");
					return None;
				};
				Some(RemoteStudy {
					study_instance_uid,
					accession_number: answer
						.accession_number()
						.unwrap_or_else(|| accession.as_str().to_owned()),
					patient_id: answer.patient_id(),
					study_date: answer.study_date(),
					modality: answer
						.get_str(tags::MODALITIES_IN_STUDY)
						.or_else(|| answer.modality()),
				})
			})
			.collect();
		debug!(studies = studies.len(), "Resolved accession on remote modality");
		Ok(studies)
	}

	pub async fn remote_series(&self, study: &RemoteStudy) -> Result<Vec<RemoteSeries>, ArchiveError> {
		let query = ArchiveQuery::new(QueryRetrieveLevel::Series)
			.matching("StudyInstanceUID", study.study_instance_uid.as_str())
			.matching("SeriesInstanceUID", "")
			.matching("SeriesDescription", "")
			.matching("SeriesNumber", "")
			.matching("NumberOfSeriesRelatedInstances", "");
		let answers = self.archive.query_all(&self.modality, &query).await?;

		Ok(answers
			.into_iter()
			.filter_map(|answer| {
				Some(RemoteSeries {
					study_instance_uid: study.study_instance_uid.clone(),
					series_instance_uid: answer.series_instance_uid()?,
					description: answer.series_description(),
					number: answer.series_number(),
					instance_count: answer.series_related_instances(),
				})
			})
			.collect())
	}

	/// Number of instances the modality holds for `series`. Modalities that leave out
	/// NumberOfSeriesRelatedInstances are asked for the instances themselves.
	pub async fn remote_instance_count(&self, series: &RemoteSeries) -> Result<usize, ArchiveError> {
		if let Some(count) = series.instance_count {
			return Ok(count);
		}
		let query = ArchiveQuery::new(QueryRetrieveLevel::Instance)
			.matching("StudyInstanceUID", series.study_instance_uid.as_str())
			.matching("SeriesInstanceUID", series.series_instance_uid.as_str())
			.matching("SOPInstanceUID", "");
		Ok(self.archive.query_all(&self.modality, &query).await?.len())
	}

	/// Finds studies with `accession` in the archive's own store.
	#[instrument(skip_all, fields(accession = %accession))]
	pub async fn resolve_local(
		&self,
		accession: &AccessionRequest,
	) -> Result<Vec<LocalStudy>, ArchiveError> {
		let query = ArchiveQuery::new(QueryRetrieveLevel::Study)
			.matching("AccessionNumber", accession.as_str());
		let ids = self.archive.find(&query).await?;
		debug!(studies = ids.len(), "Resolved accession in local store");

		stream::iter(ids)
			.then(|id| async move { self.archive.study(&id).await })
			.try_collect()
			.await
	}

	/// Returns the local study with `study_instance_uid`, if the archive holds it.
	pub async fn local_study(
		&self,
		study_instance_uid: &str,
	) -> Result<Option<LocalStudy>, ArchiveError> {
		let query = ArchiveQuery::new(QueryRetrieveLevel::Study)
			.matching("StudyInstanceUID", study_instance_uid);
		match self.archive.find(&query).await?.into_iter().next() {
			Some(id) => Ok(Some(self.archive.study(&id).await?)),
			None => Ok(None),
		}
	}

	/// Returns the local id of the series with `series_instance_uid`, if the archive holds it.
	pub async fn local_series_id(
		&self,
		series_instance_uid: &str,
	) -> Result<Option<ResourceId>, ArchiveError> {
		let query = ArchiveQuery::new(QueryRetrieveLevel::Series)
			.matching("SeriesInstanceUID", series_instance_uid);
		Ok(self.archive.find(&query).await?.into_iter().next())
	}

	/// Lists the series of a local study, fetching records that were only listed by id.
	pub async fn local_series(&self, study: &LocalStudy) -> Result<Vec<LocalSeries>, ArchiveError> {
		let entries = self.archive.study_series(&study.id).await?;
		let archive = self.archive.as_ref();
		stream::iter(entries)
			.then(|entry| entry.resolve(archive))
			.try_collect()
			.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pipeline::testing::{FakeArchive, RemoteInstance};

	fn accession(value: &str) -> AccessionRequest {
		AccessionRequest::new(value).unwrap()
	}

	fn archive_with_two_series() -> Arc<FakeArchive> {
		let mut remote = RemoteInstance::series("ACC123", "ADC", "5", 2, b"adc");
		remote.extend(RemoteInstance::series("ACC123", "LOC", "1", 1, b"loc"));
		remote.extend(RemoteInstance::series("ACC999", "T2", "2", 1, b"t2"));
		Arc::new(FakeArchive::new(remote))
	}

	#[tokio::test]
	async fn resolves_remote_study_and_series() {
		let archive = archive_with_two_series();
		let resolver = AccessionResolver::new(Arc::clone(&archive) as Arc<dyn Archive>, "PACS");

		let studies = resolver.resolve_remote(&accession("ACC123")).await.unwrap();
		assert_eq!(studies.len(), 1);
		assert_eq!(studies[0].study_instance_uid, "1.2.ACC123");
		assert_eq!(studies[0].study_date.as_deref(), Some("20240101"));

		let series = resolver.remote_series(&studies[0]).await.unwrap();
		let descriptions: Vec<_> = series
			.iter()
			.map(|series| series.description.as_deref().unwrap())
			.collect();
		assert_eq!(descriptions, vec!["ADC", "LOC"]);
		assert_eq!(series[0].number.as_deref(), Some("5"));
		assert_eq!(series[0].instance_count, Some(2));
		assert_eq!(series[1].instance_count, Some(1));
		assert_eq!(studies[0].accession_number, "ACC123");
	}

	#[tokio::test]
	async fn instance_count_falls_back_to_an_instance_query() {
		let archive = archive_with_two_series();
		archive.state().omit_instance_counts = true;
		let resolver = AccessionResolver::new(Arc::clone(&archive) as Arc<dyn Archive>, "PACS");

		let studies = resolver.resolve_remote(&accession("ACC123")).await.unwrap();
		let series = resolver.remote_series(&studies[0]).await.unwrap();
		assert_eq!(series[0].instance_count, None);

		let queries_before = archive.state().queries.len();
		assert_eq!(resolver.remote_instance_count(&series[0]).await.unwrap(), 2);
		assert_eq!(resolver.remote_instance_count(&series[1]).await.unwrap(), 1);

		let state = archive.state();
		assert_eq!(state.queries.len(), queries_before + 2);
		assert_eq!(state.queries[queries_before].level, QueryRetrieveLevel::Instance);
	}

	#[tokio::test]
	async fn unknown_accession_resolves_to_nothing() {
		let archive = archive_with_two_series();
		let resolver = AccessionResolver::new(Arc::clone(&archive) as Arc<dyn Archive>, "PACS");
		assert!(resolver
			.resolve_remote(&accession("NOPE"))
			.await
			.unwrap()
			.is_empty());
	}

	#[tokio::test]
	async fn query_failures_are_reported() {
		let archive = archive_with_two_series();
		archive.state().reject_queries = true;
		let resolver = AccessionResolver::new(Arc::clone(&archive) as Arc<dyn Archive>, "PACS");
		assert!(matches!(
			resolver.resolve_remote(&accession("ACC123")).await,
			Err(ArchiveError::Status { status: 401, .. })
		));
	}

	#[tokio::test]
	async fn local_series_resolve_inline_and_referenced_entries() {
		let archive = archive_with_two_series();
		let remote = archive.state().remote.clone();
		for instance in &remote {
			archive.store_locally(instance);
		}
		let resolver = AccessionResolver::new(Arc::clone(&archive) as Arc<dyn Archive>, "PACS");

		let studies = resolver.resolve_local(&accession("ACC123")).await.unwrap();
		assert_eq!(studies.len(), 1);

		let series = resolver.local_series(&studies[0]).await.unwrap();
		assert_eq!(series.len(), 2);
		assert_eq!(series[0].instances.len(), 2);
		assert_eq!(series[1].tags.series_description.as_deref(), Some("LOC"));

		let id = resolver.local_series_id("1.2.ACC123.LOC").await.unwrap();
		assert_eq!(id.as_deref(), Some("series-1.2.ACC123.LOC"));
		assert!(resolver.local_series_id("1.2.3.4").await.unwrap().is_none());
	}
}
