pub(crate) mod accession;
pub(crate) mod archive;
pub(crate) mod check;
pub(crate) mod cli;
pub(crate) mod config;
pub(crate) mod convert;
pub(crate) mod oracle;
pub(crate) mod pipeline;
pub(crate) mod report;
pub(crate) mod summary;
pub(crate) mod types;

use crate::accession::AccessionList;
use crate::archive::orthanc::OrthancClient;
use crate::check::StructureChecker;
use crate::cli::{CheckArgs, Cli, Command};
use crate::config::{AppConfig, ConfigurationError};
use crate::convert::NiftiConverter;
use crate::oracle::{ClassificationOracle, HttpOracle};
use crate::pipeline::shutdown::Shutdown;
use crate::pipeline::{Pipeline, RunMode};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, level_filters::LevelFilter, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logger(level: Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	}

	guard
}

fn main() -> ExitCode {
	let cli = Cli::parse();
	let config = match AppConfig::load(&cli.config, &cli.overrides) {
		Ok(config) => config,
		Err(err) => {
			init_logger(Level::INFO);
			error!("{err}");
			return ExitCode::FAILURE;
		}
	};
	init_logger(config.telemetry.level.into());

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	let runtime = match tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
	{
		Ok(runtime) => runtime,
		Err(err) => {
			error!("Failed to start the async runtime: {err}");
			return ExitCode::FAILURE;
		}
	};

	runtime.block_on(async move {
		match run(cli, config).await {
			Ok(code) => code,
			Err(err) => {
				error!("{err:#}");
				ExitCode::FAILURE
			}
		}
	})
}

async fn run(cli: Cli, mut config: AppConfig) -> anyhow::Result<ExitCode> {
	let (mode, input) = match &cli.command {
		Command::Remote(input) => (RunMode::Remote, input),
		Command::Local(input) => (RunMode::Local, input),
		Command::Check(args) => return run_check(args, &config).await,
	};
	let accessions = AccessionList::collect(&input.accessions, input.input_file.as_deref())?;
	info!(accessions = accessions.len(), "Collected accession numbers");

	if config.conversion.enabled
		&& !NiftiConverter::new(&config.conversion).is_available().await
	{
		warn!(
			program = %config.conversion.program,
			"NIfTI converter is not available, skipping conversion"
		);
		config.conversion.enabled = false;
	}

	let archive =
		OrthancClient::new(&config.archive).map_err(|err| ConfigurationError::Client {
			component: "archive client",
			message: err.to_string(),
		})?;
	let oracle: Option<Arc<dyn ClassificationOracle>> = match &config.oracle.url {
		Some(url) => {
			let oracle = HttpOracle::new(url.as_str(), &config.oracle).map_err(|err| {
				ConfigurationError::Client {
					component: "oracle client",
					message: err.to_string(),
				}
			})?;
			Some(Arc::new(oracle))
		}
		None => {
			warn!("No classification oracle configured, series are not sampled");
			None
		}
	};

	let shutdown = Shutdown::new();
	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			shutdown_signal().await;
			warn!("Received shutdown signal, letting in-flight downloads finish");
			shutdown.trigger();
		}
	});

	let pipeline = Pipeline::new(&config, Arc::new(archive), oracle, shutdown);
	let outcome = pipeline.run(mode, &accessions).await;

	if let Err(err) = report::write_reports(&config.report, &outcome.reports) {
		error!("{err}");
	}

	if outcome.summary.resolved == 0 {
		error!("None of the accession numbers could be resolved");
		return Ok(ExitCode::FAILURE);
	}
	Ok(ExitCode::SUCCESS)
}

async fn run_check(args: &CheckArgs, config: &AppConfig) -> anyhow::Result<ExitCode> {
	let root = args
		.directory
		.clone()
		.unwrap_or_else(|| config.download.output.clone());
	let checker = StructureChecker::new(args.dry_run);
	let report = tokio::task::spawn_blocking(move || checker.run(&root)).await??;
	report.summary.log(args.dry_run);

	if let Err(err) = check::write_reports(&config.report, &report) {
		error!("{err}");
	}
	Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(err) = signal::ctrl_c().await {
			error!("Failed to listen for Ctrl-C: {err}");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut terminate) => {
				terminate.recv().await;
			}
			Err(err) => {
				error!("Failed to listen for SIGTERM: {err}");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
}
