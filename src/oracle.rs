//! The classification oracle labels a sampled instance with its acquisition type.

use crate::config::OracleConfig;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

const FIELD_NAME: &str = "dicom_file_list";
const FILE_NAME: &str = "IM0";
const DICOM_MIME: &str = "application/dicom";

#[async_trait]
pub trait ClassificationOracle: Send + Sync {
	/// Returns the label for `payload`, or `None` if the oracle could not classify it.
	async fn classify(&self, payload: Bytes) -> Result<Option<String>, OracleError>;
}

#[derive(Debug, Error)]
pub enum OracleError {
	#[error("Classification request failed: {0}")]
	Http(#[from] reqwest::Error),
	#[error("Classification service returned status {status}: {message}")]
	Status { status: u16, message: String },
	#[error("Unexpected classification response: {0}")]
	Decode(String),
}

/// Classification oracle reached over HTTP with a multipart upload.
pub struct HttpOracle {
	client: Client,
	url: String,
	credentials: Option<(String, String)>,
}

impl HttpOracle {
	pub fn new(url: impl Into<String>, config: &OracleConfig) -> Result<Self, reqwest::Error> {
		let client = Client::builder()
			.timeout(Duration::from_millis(config.timeout))
			.build()?;
		let credentials = match (&config.username, &config.password) {
			(Some(username), Some(password)) => Some((username.clone(), password.clone())),
			_ => None,
		};

		Ok(Self {
			client,
			url: url.into(),
			credentials,
		})
	}
}

#[async_trait]
impl ClassificationOracle for HttpOracle {
	#[instrument(skip_all, fields(size = payload.len()))]
	async fn classify(&self, payload: Bytes) -> Result<Option<String>, OracleError> {
		let part = Part::stream(payload)
			.file_name(FILE_NAME)
			.mime_str(DICOM_MIME)?;
		let form = Form::new().part(FIELD_NAME, part);

		let mut request = self.client.post(&self.url).multipart(form);
		if let Some((username, password)) = &self.credentials {
			request = request.basic_auth(username, Some(password));
		}

		let response = request.send().await?;
		let status = response.status();
		if !status.is_success() {
			let message = response.text().await.unwrap_or_default();
			return Err(OracleError::Status {
				status: status.as_u16(),
				message,
			});
		}

		let body: Value = response.json().await?;
		let label = parse_label(&body)?;
		debug!(label = label.as_deref().unwrap_or("none"), "Classified sample");
		Ok(label)
	}
}

/// Extracts `series_type` from the first element of the response array.
/// An empty label or `unknown` (in any case) means the oracle did not recognize the series.
pub fn parse_label(body: &Value) -> Result<Option<String>, OracleError> {
	let results = body
		.as_array()
		.ok_or_else(|| OracleError::Decode(String::from("expected a JSON array")))?;

	let label = results
		.first()
		.and_then(|first| first.get("series_type"))
		.and_then(Value::as_str)
		.map(str::trim)
		.filter(|label| !label.is_empty() && !label.eq_ignore_ascii_case("unknown"));

	Ok(label.map(str::to_owned))
}
