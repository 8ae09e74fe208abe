use dicom::core::Tag;
use dicom::dictionary_std::tags;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// A decoded tag set as returned by the archive for query answers.
///
/// The archive encodes every attribute as `"gggg,eeee": { "Name": ..., "Type": ..., "Value": ... }`.
/// Lookups go through [`Tag`] constants so callers never spell tag keys by hand.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct TagSet(HashMap<String, Value>);

impl TagSet {
	/// Returns the trimmed string value of `tag`, or `None` if it is absent or empty.
	pub fn get_str(&self, tag: Tag) -> Option<String> {
		let key = tag_key(tag);
		let entry = self
			.0
			.get(&key)
			.or_else(|| self.0.get(&key.to_uppercase()))?;

		let value = match entry {
			Value::Object(attribute) => attribute.get("Value")?,
			other => other,
		};

		let text = match value {
			Value::String(text) => text.trim().to_owned(),
			Value::Number(number) => number.to_string(),
			// Multi-valued attributes are reduced to their first value.
			Value::Array(values) => match values.first()? {
				Value::String(text) => text.trim().to_owned(),
				Value::Number(number) => number.to_string(),
				_ => return None,
			},
			_ => return None,
		};

		(!text.is_empty()).then_some(text)
	}

	pub fn study_instance_uid(&self) -> Option<String> {
		self.get_str(tags::STUDY_INSTANCE_UID)
	}

	pub fn series_instance_uid(&self) -> Option<String> {
		self.get_str(tags::SERIES_INSTANCE_UID)
	}

	pub fn sop_instance_uid(&self) -> Option<String> {
		self.get_str(tags::SOP_INSTANCE_UID)
	}

	pub fn series_description(&self) -> Option<String> {
		self.get_str(tags::SERIES_DESCRIPTION)
	}

	pub fn series_number(&self) -> Option<String> {
		self.get_str(tags::SERIES_NUMBER)
	}

	pub fn accession_number(&self) -> Option<String> {
		self.get_str(tags::ACCESSION_NUMBER)
	}

	/// NumberOfSeriesRelatedInstances, if the archive reported a parseable count.
	pub fn series_related_instances(&self) -> Option<usize> {
		self.get_str(tags::NUMBER_OF_SERIES_RELATED_INSTANCES)?
			.parse()
			.ok()
	}

	pub fn patient_id(&self) -> Option<String> {
		self.get_str(tags::PATIENT_ID)
	}

	pub fn study_date(&self) -> Option<String> {
		self.get_str(tags::STUDY_DATE)
	}

	pub fn modality(&self) -> Option<String> {
		self.get_str(tags::MODALITY)
	}
}

/// Formats a tag the way the archive keys its answer content (`0020,000d`).
pub fn tag_key(tag: Tag) -> String {
	format!("{:04x},{:04x}", tag.group(), tag.element())
}
