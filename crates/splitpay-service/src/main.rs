use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use splitpay_config::ConfigLoader;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod service;

#[derive(Parser)]
#[command(name = "splitpay")]
#[command(about = "Split-bill settlement service", long_about = None)]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,

	#[arg(short, long, value_name = "FILE", default_value = "config/local.toml")]
	config: PathBuf,

	#[arg(long, env = "SPLITPAY_LOG_LEVEL", default_value = "info")]
	log_level: String,
}

#[derive(Subcommand)]
enum Commands {
	/// Start the settlement service
	Start,
	/// Validate the configuration file
	Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	setup_tracing(&cli.log_level);

	match cli.command {
		Some(Commands::Start) | None => start_service(cli).await,
		Some(Commands::Validate) => validate_config(cli).await,
	}
}

async fn start_service(cli: Cli) -> Result<()> {
	info!("Starting split-bill settlement service");
	info!("Loading configuration from: {:?}", cli.config);

	let config = ConfigLoader::new()
		.with_file(&cli.config)
		.load()
		.await
		.context("Failed to load configuration")?;

	info!("Service name: {}", config.service.name);
	info!("HTTP port: {}", config.service.http_port);
	info!(
		"Poll interval: {}ms, session timeout: {}s",
		config.settlement.poll_interval_ms, config.settlement.session_timeout_secs
	);

	let host = config.service.host.clone();
	let port = config.service.http_port;
	let reap_every = config.settlement.poll_interval() * 10;
	let service = Arc::new(
		service::SplitService::from_config(config).context("Failed to build split service")?,
	);

	let http_service = service.clone();
	let http_handle =
		tokio::spawn(async move { api::start_http_server(http_service, host, port).await });

	// Settled sessions stop their coordinators; drop them from the service.
	let reaper_service = service.clone();
	let reaper = tokio::spawn(async move {
		let mut ticker = tokio::time::interval(reap_every);
		loop {
			ticker.tick().await;
			reaper_service.reap_finished();
		}
	});

	info!("Split-bill settlement service started");

	tokio::select! {
		_ = setup_shutdown_signal() => {
			info!("Shutdown signal received, stopping services...");
		}
		result = http_handle => {
			match result {
				Ok(Ok(())) => warn!("HTTP server exited"),
				Ok(Err(e)) => return Err(e.context("HTTP server failed")),
				Err(e) => return Err(anyhow::anyhow!("HTTP server task panicked: {}", e)),
			}
		}
	}

	reaper.abort();
	service.shutdown().await;
	info!("Split-bill settlement service stopped");
	Ok(())
}

async fn validate_config(cli: Cli) -> Result<()> {
	info!("Validating configuration file: {:?}", cli.config);

	let config = ConfigLoader::new()
		.with_file(&cli.config)
		.load()
		.await
		.context("Failed to load configuration")?;

	info!("Configuration is valid");
	info!("Service name: {}", config.service.name);
	info!("Storage backend: {}", config.storage.backend);
	info!("Payment provider: {}", config.payment.provider);
	info!(
		"Settlement: poll every {}ms, expire after {}s, split tolerance {} {}",
		config.settlement.poll_interval_ms,
		config.settlement.session_timeout_secs,
		config.settlement.split_epsilon,
		config.settlement.currency
	);

	Ok(())
}

fn setup_tracing(log_level: &str) {
	let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

	tracing_subscriber::registry()
		.with(env_filter)
		.with(tracing_subscriber::fmt::layer())
		.init();
}

async fn setup_shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			warn!("Failed to listen for Ctrl+C: {}", e);
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut stream) => {
				stream.recv().await;
			}
			Err(e) => {
				warn!("Failed to install SIGTERM handler: {}", e);
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
