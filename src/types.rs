use std::fmt::{Display, Formatter};

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Identifier the archive assigns to a stored study, series or instance.
/// These are not DICOM UIDs; the archive derives them from the UID hierarchy.
pub type ResourceId = String;

/// Identifier of an asynchronous job running inside the archive.
pub type JobId = String;

/// Query/retrieve levels understood by the archive's REST API.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryRetrieveLevel {
	Study,
	Series,
	Instance,
}

impl QueryRetrieveLevel {
	pub const fn as_str(&self) -> &'static str {
		match self {
			Self::Study => "Study",
			Self::Series => "Series",
			Self::Instance => "Instance",
		}
	}
}

impl Display for QueryRetrieveLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}
