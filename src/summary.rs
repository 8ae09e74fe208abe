use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::{DefaultDicomObject, OpenFileOptions, ReadError};
use std::io::Cursor;

const PREAMBLE_LENGTH: usize = 128;
const MAGIC_CODE: &[u8; 4] = b"DICM";

/// The handful of study attributes used to name a study folder, decoded from a sampled instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudySummary {
	pub patient_id: Option<String>,
	pub study_date: Option<String>,
	pub modality: Option<String>,
	pub accession_number: Option<String>,
}

impl StudySummary {
	/// Decodes a DICOM Part-10 payload. Parsing stops before the pixel data and the 128-byte
	/// preamble is optional.
	pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReadError> {
		let body = match bytes.get(PREAMBLE_LENGTH..PREAMBLE_LENGTH + MAGIC_CODE.len()) {
			Some(magic) if magic == MAGIC_CODE => &bytes[PREAMBLE_LENGTH..],
			_ => bytes,
		};

		let object = OpenFileOptions::new()
			.read_until(tags::PIXEL_DATA)
			.from_reader(Cursor::new(body))?;

		Ok(Self {
			patient_id: element_str(&object, tags::PATIENT_ID),
			study_date: element_str(&object, tags::STUDY_DATE),
			modality: element_str(&object, tags::MODALITY),
			accession_number: element_str(&object, tags::ACCESSION_NUMBER),
		})
	}

	/// `{patient}_{date}_{modality}_{accession}`, or `None` without a study date.
	pub fn folder_key(&self) -> Option<String> {
		let study_date = self.study_date.as_deref()?;
		let or_unknown =
			|value: &Option<String>| value.clone().unwrap_or_else(|| String::from("unknown"));

		Some(format!(
			"{}_{}_{}_{}",
			or_unknown(&self.patient_id),
			study_date,
			or_unknown(&self.modality),
			or_unknown(&self.accession_number),
		))
	}
}

fn element_str(object: &DefaultDicomObject, tag: Tag) -> Option<String> {
	let value = object.element_opt(tag).ok()??.to_str().ok()?;
	let value = value.trim_end_matches('\0').trim();
	(!value.is_empty()).then(|| value.to_owned())
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use dicom::core::{DataElement, PrimitiveValue, VR};
	use dicom::dictionary_std::uids;
	use dicom::object::{FileMetaTableBuilder, InMemDicomObject};

	/// Builds a minimal MR instance as Part-10 bytes, preamble included.
	pub(crate) fn instance_bytes(study_date: Option<&str>) -> Vec<u8> {
		let mut object = InMemDicomObject::new_empty();
		let mut put = |tag: Tag, vr: VR, value: &str| {
			object.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
		};
		put(tags::SOP_CLASS_UID, VR::UI, uids::MR_IMAGE_STORAGE);
		put(tags::SOP_INSTANCE_UID, VR::UI, "1.2.3.4.5");
		put(tags::PATIENT_ID, VR::LO, "P01");
		put(tags::MODALITY, VR::CS, "MR");
		put(tags::ACCESSION_NUMBER, VR::SH, "ACC123");
		if let Some(date) = study_date {
			put(tags::STUDY_DATE, VR::DA, date);
		}

		let file = object
			.with_meta(
				FileMetaTableBuilder::new()
					.transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
					.media_storage_sop_class_uid(uids::MR_IMAGE_STORAGE)
					.media_storage_sop_instance_uid("1.2.3.4.5"),
			)
			.unwrap();

		let mut bytes = Vec::new();
		file.write_all(&mut bytes).unwrap();
		bytes
	}

	#[test]
	fn decodes_summary_with_preamble() {
		let summary = StudySummary::from_bytes(&instance_bytes(Some("20240101"))).unwrap();
		assert_eq!(summary.patient_id.as_deref(), Some("P01"));
		assert_eq!(summary.modality.as_deref(), Some("MR"));
		assert_eq!(
			summary.folder_key().as_deref(),
			Some("P01_20240101_MR_ACC123")
		);
	}

	#[test]
	fn decodes_summary_without_preamble() {
		let bytes = instance_bytes(Some("20240101"));
		let summary = StudySummary::from_bytes(&bytes[PREAMBLE_LENGTH..]).unwrap();
		assert_eq!(summary.accession_number.as_deref(), Some("ACC123"));
	}

	#[test]
	fn missing_study_date_yields_no_folder_key() {
		let summary = StudySummary::from_bytes(&instance_bytes(None)).unwrap();
		assert_eq!(summary.study_date, None);
		assert_eq!(summary.folder_key(), None);
	}

	#[test]
	fn garbage_is_rejected() {
		assert!(StudySummary::from_bytes(b"definitely not dicom").is_err());
	}
}
