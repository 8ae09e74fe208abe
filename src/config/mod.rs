use crate::cli::Overrides;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

const DEFAULTS: &str = include_str!("defaults.toml");

/// Keys whose environment variables are parsed as comma-separated lists.
const LIST_KEYS: [&str; 5] = [
	"classification.series_whitelist",
	"classification.direct_keywords",
	"classification.number_sensitive",
	"per_instance.trigger_prefixes",
	"conversion.args",
];

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	#[serde(default)]
	pub telemetry: TelemetryConfig,
	pub archive: ArchiveConfig,
	#[serde(default)]
	pub oracle: OracleConfig,
	pub classification: ClassificationConfig,
	#[serde(default)]
	pub retrieval: RetrievalConfig,
	#[serde(default)]
	pub download: DownloadConfig,
	#[serde(default)]
	pub per_instance: PerInstanceConfig,
	#[serde(default)]
	pub conversion: ConversionConfig,
	#[serde(default)]
	pub report: ReportConfig,
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
	#[error("Failed to load configuration: {0}")]
	Load(#[from] ConfigError),
	#[error("{field} is not a valid URL ({url}): {source}")]
	InvalidUrl {
		field: &'static str,
		url: String,
		#[source]
		source: url::ParseError,
	},
	#[error("{field} must use http or https, got {scheme}")]
	UnsupportedScheme { field: &'static str, scheme: String },
	#[error("{field} must be at least 1")]
	NotPositive { field: &'static str },
	#[error("Failed to initialize {component}: {message}")]
	Client {
		component: &'static str,
		message: String,
	},
}

impl AppConfig {
	/// Loads the configuration from the built-in defaults, the optional configuration `file`,
	/// environment variables (`DICOM_FETCH_ARCHIVE__URL`, ...) and command-line `overrides`,
	/// in increasing order of precedence.
	pub fn load(file: &Path, overrides: &Overrides) -> Result<Self, ConfigurationError> {
		let mut environment = Environment::with_prefix("DICOM_FETCH")
			.prefix_separator("_")
			.separator("__")
			.list_separator(",")
			.try_parsing(true);
		for key in LIST_KEYS {
			environment = environment.with_list_parse_key(key);
		}

		let path = |path: &Option<PathBuf>| {
			path.as_ref()
				.map(|path| path.to_string_lossy().into_owned())
		};

		let config: Self = Config::builder()
			.add_source(File::from_str(DEFAULTS, FileFormat::Toml))
			.add_source(File::from(file).format(FileFormat::Toml).required(false))
			.add_source(environment)
			.set_override_option("archive.url", overrides.url.clone())?
			.set_override_option("archive.username", overrides.username.clone())?
			.set_override_option("archive.password", overrides.password.clone())?
			.set_override_option("archive.modality", overrides.modality.clone())?
			.set_override_option("archive.target_aet", overrides.target_aet.clone())?
			.set_override_option("download.output", path(&overrides.output))?
			.set_override_option("download.concurrency", overrides.concurrency)?
			.set_override_option("oracle.url", overrides.oracle_url.clone())?
			.set_override_option("oracle.username", overrides.oracle_username.clone())?
			.set_override_option("oracle.password", overrides.oracle_password.clone())?
			.set_override_option(
				"classification.download_all",
				overrides.download_all.then_some(true),
			)?
			.set_override_option(
				"per_instance.enabled",
				overrides.per_instance.then_some(true),
			)?
			.set_override_option("conversion.enabled", overrides.convert.then_some(true))?
			.set_override_option("report.csv", path(&overrides.csv_report))?
			.set_override_option("report.json", path(&overrides.json_report))?
			.build()?
			.try_deserialize()?;

		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ConfigurationError> {
		validate_url("archive.url", &self.archive.url)?;
		if let Some(url) = &self.oracle.url {
			validate_url("oracle.url", url)?;
		}

		let positive = [
			("download.concurrency", u64::from(self.download.concurrency)),
			("download.retries", u64::from(self.download.retries)),
			("download.timeout", self.download.timeout),
			("retrieval.max_poll_attempts", u64::from(self.retrieval.max_poll_attempts)),
			("per_instance.concurrency", u64::from(self.per_instance.concurrency)),
		];
		for (field, value) in positive {
			if value == 0 {
				return Err(ConfigurationError::NotPositive { field });
			}
		}
		Ok(())
	}
}

fn validate_url(field: &'static str, url: &str) -> Result<(), ConfigurationError> {
	let parsed = Url::parse(url).map_err(|source| ConfigurationError::InvalidUrl {
		field,
		url: url.to_owned(),
		source,
	})?;

	match parsed.scheme() {
		"http" | "https" => Ok(()),
		scheme => Err(ConfigurationError::UnsupportedScheme {
			field,
			scheme: scheme.to_owned(),
		}),
	}
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
	Error,
	Warn,
	#[default]
	Info,
	Debug,
	Trace,
}

impl From<LogLevel> for tracing::Level {
	fn from(level: LogLevel) -> Self {
		match level {
			LogLevel::Error => Self::ERROR,
			LogLevel::Warn => Self::WARN,
			LogLevel::Info => Self::INFO,
			LogLevel::Debug => Self::DEBUG,
			LogLevel::Trace => Self::TRACE,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
	#[serde(default)]
	pub level: LogLevel,
	/// Sentry DSN. Error tracking is disabled if unset.
	pub sentry: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
	pub url: String,
	pub username: Option<String>,
	pub password: Option<String>,
	/// The remote modality studies are queried on and moved from.
	pub modality: String,
	/// The AE title of the archive itself, i.e. the move destination.
	pub target_aet: String,
	/// Request timeout in milliseconds.
	pub timeout: u64,
	/// Timeout in milliseconds for synchronous (single instance) moves.
	pub sync_move_timeout: u64,
	#[serde(default)]
	pub accept_invalid_certs: bool,
}

impl Default for ArchiveConfig {
	fn default() -> Self {
		Self {
			url: String::from("http://localhost:8042"),
			username: None,
			password: None,
			modality: String::from("PACS"),
			target_aet: String::from("ORTHANC"),
			timeout: 60_000,
			sync_move_timeout: 15_000,
			accept_invalid_certs: false,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
	/// Classification endpoint. Without it, no series is sampled.
	pub url: Option<String>,
	pub username: Option<String>,
	pub password: Option<String>,
	/// Request timeout in milliseconds.
	pub timeout: u64,
}

impl Default for OracleConfig {
	fn default() -> Self {
		Self {
			url: None,
			username: None,
			password: None,
			timeout: 30_000,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationConfig {
	/// Series types that are retrieved when the oracle assigns them.
	pub series_whitelist: Vec<String>,
	/// Series descriptions that are retrieved without sampling.
	pub direct_keywords: Vec<String>,
	/// Labels that do not tell acquisitions apart and get the series number appended
	/// when they occur more than once in a study.
	pub number_sensitive: Vec<String>,
	pub enable_whitelist: bool,
	pub enable_direct_keywords: bool,
	pub download_all: bool,
	/// Also append series numbers to labels that fell back to the series description.
	pub disambiguate_fallback_labels: bool,
}

impl Default for ClassificationConfig {
	fn default() -> Self {
		Self {
			series_whitelist: Vec::new(),
			direct_keywords: Vec::new(),
			number_sensitive: vec![String::from("DWI0"), String::from("DWI1000")],
			enable_whitelist: true,
			enable_direct_keywords: true,
			download_all: false,
			disambiguate_fallback_labels: true,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
	/// Milliseconds between two job status polls.
	pub poll_interval: u64,
	pub max_poll_attempts: u32,
}

impl Default for RetrievalConfig {
	fn default() -> Self {
		Self {
			poll_interval: 2_000,
			max_poll_attempts: 300,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
	pub output: PathBuf,
	pub concurrency: u32,
	/// Attempts per instance, including the first.
	pub retries: u32,
	/// Per-attempt fetch timeout in milliseconds.
	pub timeout: u64,
	/// Backoff base in milliseconds after a failed attempt.
	pub error_backoff: u64,
	/// Backoff base in milliseconds after a timed out attempt.
	pub timeout_backoff: u64,
}

impl Default for DownloadConfig {
	fn default() -> Self {
		Self {
			output: PathBuf::from("./downloads"),
			concurrency: 16,
			retries: 3,
			timeout: 60_000,
			error_backoff: 1_000,
			timeout_backoff: 2_000,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerInstanceConfig {
	pub enabled: bool,
	/// Series whose label starts with one of these prefixes are split by instance label.
	pub trigger_prefixes: Vec<String>,
	/// Instances classified at the same time.
	pub concurrency: u32,
}

impl Default for PerInstanceConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			trigger_prefixes: vec![String::from("DWI")],
			concurrency: 4,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversionConfig {
	pub enabled: bool,
	/// The dcm2niix executable.
	pub program: String,
	pub args: Vec<String>,
	/// Root of the NIfTI tree, mirroring the study folders of the download tree.
	pub output: PathBuf,
	/// Remove the DICOM files of a series once it has been converted.
	pub delete_dicom: bool,
}

impl Default for ConversionConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			program: String::from("dcm2niix"),
			args: ["-z", "y", "-b", "y"].map(String::from).to_vec(),
			output: PathBuf::from("./nifti"),
			delete_dicom: false,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportConfig {
	pub csv: Option<PathBuf>,
	pub json: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn load(overrides: &Overrides) -> Result<AppConfig, ConfigurationError> {
		AppConfig::load(Path::new("does-not-exist.toml"), overrides)
	}

	#[test]
	fn defaults_are_complete() {
		let config = load(&Overrides::default()).unwrap();
		assert_eq!(config.download.concurrency, 16);
		assert_eq!(config.download.retries, 3);
		assert_eq!(config.retrieval.max_poll_attempts, 300);
		assert_eq!(config.retrieval.poll_interval, 2_000);
		assert_eq!(config.classification.series_whitelist.len(), 22);
		assert_eq!(config.classification.direct_keywords, vec!["MRA_BRAIN"]);
		assert!(config.classification.disambiguate_fallback_labels);
		assert!(!config.per_instance.enabled);
		assert_eq!(config.per_instance.trigger_prefixes, vec!["DWI"]);
		assert!(!config.conversion.enabled);
		assert_eq!(config.conversion.args, vec!["-z", "y", "-b", "y"]);
		assert!(config.oracle.url.is_none());
		assert!(config.telemetry.sentry.is_none());
	}

	#[test]
	fn command_line_overrides_take_precedence() {
		let overrides = Overrides {
			url: Some(String::from("https://pacs.example.org/orthanc")),
			concurrency: Some(4),
			download_all: true,
			convert: true,
			output: Some(PathBuf::from("/tmp/out")),
			..Overrides::default()
		};
		let config = load(&overrides).unwrap();
		assert!(config.conversion.enabled);
		assert_eq!(config.archive.url, "https://pacs.example.org/orthanc");
		assert_eq!(config.download.concurrency, 4);
		assert_eq!(config.download.output, PathBuf::from("/tmp/out"));
		assert!(config.classification.download_all);
	}

	#[test]
	fn rejects_invalid_archive_url() {
		let overrides = Overrides {
			url: Some(String::from("not a url")),
			..Overrides::default()
		};
		assert!(matches!(
			load(&overrides),
			Err(ConfigurationError::InvalidUrl { field: "archive.url", .. })
		));

		let overrides = Overrides {
			url: Some(String::from("ftp://pacs")),
			..Overrides::default()
		};
		assert!(matches!(
			load(&overrides),
			Err(ConfigurationError::UnsupportedScheme { .. })
		));
	}

	#[test]
	fn rejects_zero_concurrency() {
		let overrides = Overrides {
			concurrency: Some(0),
			..Overrides::default()
		};
		assert!(matches!(
			load(&overrides),
			Err(ConfigurationError::NotPositive {
				field: "download.concurrency"
			})
		));
	}

	#[test]
	fn rejects_zero_download_timeout() {
		let mut config = load(&Overrides::default()).unwrap();
		config.download.timeout = 0;
		assert!(matches!(
			config.validate(),
			Err(ConfigurationError::NotPositive {
				field: "download.timeout"
			})
		));

		config.download.timeout = 1;
		assert!(config.validate().is_ok());
	}
}
