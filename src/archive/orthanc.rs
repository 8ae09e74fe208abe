use crate::archive::tags::TagSet;
use crate::archive::{
	Archive, ArchiveError, ArchiveQuery, FoundResource, JobState, JobStatus, LocalSeries,
	LocalStudy, MoveMode, MoveRequest, QueryHandle, SeriesEntry,
};
use crate::config::ArchiveConfig;
use crate::types::{JobId, ResourceId};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{instrument, trace};

/// [`Archive`] implementation backed by the Orthanc REST API.
#[derive(Clone)]
pub struct OrthancClient {
	client: Client,
	base_url: String,
	credentials: Option<(String, String)>,
	sync_move_timeout: Duration,
}

impl OrthancClient {
	pub fn new(config: &ArchiveConfig) -> Result<Self, reqwest::Error> {
		let client = Client::builder()
			.danger_accept_invalid_certs(config.accept_invalid_certs)
			.timeout(Duration::from_millis(config.timeout))
			.build()?;

		let credentials = match (&config.username, &config.password) {
			(Some(username), Some(password)) => Some((username.clone(), password.clone())),
			_ => None,
		};

		Ok(Self {
			client,
			base_url: config.url.trim_end_matches('/').to_owned(),
			credentials,
			sync_move_timeout: Duration::from_millis(config.sync_move_timeout),
		})
	}

	fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
		let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
		let builder = self.client.request(method, url);
		match &self.credentials {
			Some((username, password)) => builder.basic_auth(username, Some(password)),
			None => builder,
		}
	}

	async fn send(&self, endpoint: &str, builder: RequestBuilder) -> Result<Response, ArchiveError> {
		let response = builder.send().await.map_err(|source| ArchiveError::Http {
			endpoint: endpoint.to_owned(),
			source,
		})?;

		let status = response.status();
		if status.is_success() {
			trace!(endpoint, status = status.as_u16(), "Archive responded");
			return Ok(response);
		}

		// The archive puts its error detail into the body; keep it for the user.
		let message = response.text().await.unwrap_or_default();
		Err(ArchiveError::Status {
			endpoint: endpoint.to_owned(),
			status: status.as_u16(),
			message,
		})
	}

	async fn json<T: DeserializeOwned>(
		&self,
		endpoint: &str,
		builder: RequestBuilder,
	) -> Result<T, ArchiveError> {
		self.send(endpoint, builder)
			.await?
			.json::<T>()
			.await
			.map_err(|err| ArchiveError::Decode {
				endpoint: endpoint.to_owned(),
				message: err.to_string(),
			})
	}

	fn query_payload(query: &ArchiveQuery, normalize: bool) -> Value {
		let mut payload = json!({
			"Level": query.level.as_str(),
			"Query": query.criteria,
		});
		if normalize {
			payload["Normalize"] = Value::Bool(true);
		}
		if let Some(limit) = query.limit {
			payload["Limit"] = Value::from(limit);
		}
		payload
	}
}

#[derive(Deserialize)]
struct CreatedResource {
	#[serde(rename = "ID")]
	id: Option<String>,
}

#[derive(Deserialize)]
struct JobInfo {
	#[serde(rename = "State", default)]
	state: String,
	#[serde(rename = "Progress", default)]
	progress: f64,
	#[serde(rename = "ErrorDetails", default)]
	error_details: Option<String>,
	#[serde(rename = "ErrorDescription", default)]
	error_description: Option<String>,
}

impl From<JobInfo> for JobStatus {
	fn from(info: JobInfo) -> Self {
		let error_detail = info
			.error_details
			.filter(|detail| !detail.is_empty())
			.or(info.error_description)
			.filter(|detail| !detail.is_empty());
		Self {
			state: JobState::from(info.state.as_str()),
			progress: info.progress,
			error_detail,
		}
	}
}

#[async_trait]
impl Archive for OrthancClient {
	#[instrument(skip_all, fields(level = %query.level))]
	async fn find(&self, query: &ArchiveQuery) -> Result<Vec<ResourceId>, ArchiveError> {
		let endpoint = "tools/find";
		let builder = self
			.request(Method::POST, endpoint)
			.json(&Self::query_payload(query, false));
		let found: Vec<FoundResource> = self.json(endpoint, builder).await?;
		Ok(found.into_iter().map(ResourceId::from).collect())
	}

	#[instrument(skip_all, fields(modality = %modality, level = %query.level))]
	async fn query(
		&self,
		modality: &str,
		query: &ArchiveQuery,
	) -> Result<QueryHandle, ArchiveError> {
		let endpoint = format!("modalities/{modality}/query");
		let builder = self
			.request(Method::POST, &endpoint)
			.json(&Self::query_payload(query, true));
		let created: CreatedResource = self.json(&endpoint, builder).await?;
		created
			.id
			.map(QueryHandle)
			.ok_or_else(|| ArchiveError::Decode {
				endpoint,
				message: String::from("response carries no query ID"),
			})
	}

	async fn answers(&self, handle: &QueryHandle) -> Result<Vec<String>, ArchiveError> {
		let endpoint = format!("queries/{}/answers", handle.0);
		let builder = self.request(Method::GET, &endpoint);
		self.json(&endpoint, builder).await
	}

	async fn answer_content(
		&self,
		handle: &QueryHandle,
		index: &str,
	) -> Result<TagSet, ArchiveError> {
		let endpoint = format!("queries/{}/answers/{index}/content", handle.0);
		let builder = self.request(Method::GET, &endpoint);
		self.json(&endpoint, builder).await
	}

	#[instrument(skip_all, fields(modality = %modality, level = %request.level))]
	async fn move_resource(
		&self,
		modality: &str,
		request: &MoveRequest,
	) -> Result<Option<JobId>, ArchiveError> {
		let endpoint = format!("modalities/{modality}/move");
		let synchronous = request.mode == MoveMode::Synchronous;
		let payload = json!({
			"Level": request.level.as_str(),
			"Resources": [request.identifier],
			"TargetAet": request.target_aet,
			"Synchronous": synchronous,
		});

		let mut builder = self.request(Method::POST, &endpoint).json(&payload);
		if synchronous {
			builder = builder.timeout(self.sync_move_timeout);
			self.send(&endpoint, builder).await?;
			return Ok(None);
		}

		builder = builder.header("Asynchronous", "true");
		let created: CreatedResource = self.json(&endpoint, builder).await?;
		Ok(created.id)
	}

	async fn job_status(&self, job: &str) -> Result<JobStatus, ArchiveError> {
		let endpoint = format!("jobs/{job}");
		let builder = self.request(Method::GET, &endpoint);
		let info: JobInfo = self.json(&endpoint, builder).await?;
		Ok(JobStatus::from(info))
	}

	async fn study(&self, study: &str) -> Result<LocalStudy, ArchiveError> {
		let endpoint = format!("studies/{study}");
		let builder = self.request(Method::GET, &endpoint);
		self.json(&endpoint, builder).await
	}

	async fn study_series(&self, study: &str) -> Result<Vec<SeriesEntry>, ArchiveError> {
		let endpoint = format!("studies/{study}/series");
		let builder = self.request(Method::GET, &endpoint);
		self.json(&endpoint, builder).await
	}

	async fn series(&self, series: &str) -> Result<LocalSeries, ArchiveError> {
		let endpoint = format!("series/{series}");
		let builder = self.request(Method::GET, &endpoint);
		self.json(&endpoint, builder).await
	}

	async fn instance_file(&self, instance: &str) -> Result<Bytes, ArchiveError> {
		let endpoint = format!("instances/{instance}/file");
		let builder = self.request(Method::GET, &endpoint);
		self.send(&endpoint, builder)
			.await?
			.bytes()
			.await
			.map_err(|source| ArchiveError::Http { endpoint, source })
	}

	async fn delete_instance(&self, instance: &str) -> Result<(), ArchiveError> {
		let endpoint = format!("instances/{instance}");
		let builder = self.request(Method::DELETE, &endpoint);
		self.send(&endpoint, builder).await?;
		Ok(())
	}
}
