use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "dicom-fetch")]
#[command(about = "Retrieve, classify and download DICOM studies by accession number")]
#[command(version)]
pub struct Cli {
	/// Configuration file layered over the built-in defaults.
	#[arg(long, global = true, default_value = "dicom-fetch.toml")]
	pub config: PathBuf,

	#[command(flatten)]
	pub overrides: Overrides,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
	/// Query the remote modality, retrieve matching series and download them.
	Remote(InputArgs),
	/// Download studies that are already stored in the archive.
	Local(InputArgs),
	/// Repair the folder structure of a previous download.
	Check(CheckArgs),
}

#[derive(Debug, Clone, Args)]
pub struct InputArgs {
	/// Accession numbers to process.
	pub accessions: Vec<String>,

	/// CSV or JSON file with additional accession numbers.
	#[arg(short = 'f', long)]
	pub input_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct CheckArgs {
	/// Download tree to check. Defaults to the configured output directory.
	pub directory: Option<PathBuf>,

	/// Report the actions without touching any file.
	#[arg(long)]
	pub dry_run: bool,
}

/// Settings that take precedence over the configuration file and the environment.
#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
	/// Base URL of the archive REST API.
	#[arg(long, global = true)]
	pub url: Option<String>,

	#[arg(long, global = true)]
	pub username: Option<String>,

	#[arg(long, global = true)]
	pub password: Option<String>,

	/// Remote modality queried and moved from.
	#[arg(long, global = true)]
	pub modality: Option<String>,

	/// AE title that receives moved instances.
	#[arg(long, global = true)]
	pub target_aet: Option<String>,

	#[arg(short, long, global = true)]
	pub output: Option<PathBuf>,

	/// Maximum number of instance downloads in flight.
	#[arg(short, long, global = true)]
	pub concurrency: Option<u64>,

	#[arg(long, global = true)]
	pub oracle_url: Option<String>,

	#[arg(long, global = true)]
	pub oracle_username: Option<String>,

	#[arg(long, global = true)]
	pub oracle_password: Option<String>,

	/// Download every series without classification.
	#[arg(long, global = true)]
	pub download_all: bool,

	/// Split series by the label of every single instance.
	#[arg(long, global = true)]
	pub per_instance: bool,

	/// Convert downloaded series to NIfTI with dcm2niix.
	#[arg(long, global = true)]
	pub convert: bool,

	#[arg(long, global = true)]
	pub csv_report: Option<PathBuf>,

	#[arg(long, global = true)]
	pub json_report: Option<PathBuf>,
}
