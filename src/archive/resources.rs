use crate::archive::{Archive, ArchiveError};
use crate::types::{ResourceId, UI};
use serde::Deserialize;

/// A study stored in the local archive (`GET /studies/{id}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LocalStudy {
	#[serde(rename = "ID")]
	pub id: ResourceId,
	#[serde(rename = "MainDicomTags", default)]
	pub tags: StudyTags,
	#[serde(rename = "PatientMainDicomTags", default)]
	pub patient: PatientTags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StudyTags {
	#[serde(rename = "StudyInstanceUID")]
	pub study_instance_uid: Option<UI>,
	#[serde(rename = "AccessionNumber")]
	pub accession_number: Option<String>,
	#[serde(rename = "StudyDate")]
	pub study_date: Option<String>,
	#[serde(rename = "ModalitiesInStudy")]
	pub modalities_in_study: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PatientTags {
	#[serde(rename = "PatientID")]
	pub patient_id: Option<String>,
}

/// A series stored in the local archive (`GET /series/{id}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LocalSeries {
	#[serde(rename = "ID")]
	pub id: ResourceId,
	#[serde(rename = "MainDicomTags", default)]
	pub tags: SeriesTags,
	/// Ids of the instances in this series, in the order the archive lists them.
	#[serde(rename = "Instances", default)]
	pub instances: Vec<ResourceId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SeriesTags {
	#[serde(rename = "SeriesInstanceUID")]
	pub series_instance_uid: Option<UI>,
	#[serde(rename = "SeriesDescription")]
	pub series_description: Option<String>,
	#[serde(rename = "SeriesNumber")]
	pub series_number: Option<String>,
}

/// Listing endpoints return either the full series record or only its id,
/// depending on the archive version and the `expand` option.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SeriesEntry {
	Inline(LocalSeries),
	Reference(ResourceId),
}

impl SeriesEntry {
	/// Returns the full record, fetching it from the archive if only a reference was listed.
	pub async fn resolve(self, archive: &dyn Archive) -> Result<LocalSeries, ArchiveError> {
		match self {
			Self::Inline(series) => Ok(series),
			Self::Reference(id) => archive.series(&id).await,
		}
	}
}

/// The `find` endpoint answers with bare ids or with `{"ID": ...}` objects.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub(crate) enum FoundResource {
	Id(ResourceId),
	Object {
		#[serde(rename = "ID")]
		id: ResourceId,
	},
}

impl From<FoundResource> for ResourceId {
	fn from(found: FoundResource) -> Self {
		match found {
			FoundResource::Id(id) | FoundResource::Object { id } => id,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn series_entries_accept_records_and_references() {
		let entries: Vec<SeriesEntry> = serde_json::from_value(json!([
			{
				"ID": "s-1",
				"Instances": ["i-1", "i-2"],
				"MainDicomTags": { "SeriesDescription": "ADC", "SeriesNumber": "5" }
			},
			"s-2"
		]))
		.unwrap();

		assert_eq!(entries[1], SeriesEntry::Reference(String::from("s-2")));
		match &entries[0] {
			SeriesEntry::Inline(series) => {
				assert_eq!(series.id, "s-1");
				assert_eq!(series.instances, vec!["i-1", "i-2"]);
				assert_eq!(series.tags.series_description.as_deref(), Some("ADC"));
				assert_eq!(series.tags.series_number.as_deref(), Some("5"));
			}
			SeriesEntry::Reference(_) => panic!("expected an inline record"),
		}
	}

	#[test]
	fn found_resources_reduce_to_ids() {
		let found: Vec<FoundResource> =
			serde_json::from_value(json!(["a", { "ID": "b", "Type": "Study" }])).unwrap();
		let ids: Vec<ResourceId> = found.into_iter().map(ResourceId::from).collect();
		assert_eq!(ids, vec!["a", "b"]);
	}

	#[test]
	fn local_study_reads_patient_tags() {
		let study: LocalStudy = serde_json::from_value(json!({
			"ID": "st-1",
			"MainDicomTags": { "StudyInstanceUID": "1.2.3", "AccessionNumber": "ACC1", "StudyDate": "20240101" },
			"PatientMainDicomTags": { "PatientID": "P01" }
		}))
		.unwrap();
		assert_eq!(study.tags.study_instance_uid.as_deref(), Some("1.2.3"));
		assert_eq!(study.patient.patient_id.as_deref(), Some("P01"));
	}
}
