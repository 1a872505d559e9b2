//! Codeshare broker binary.
//!
//! The broker runs as a daemon process and manages:
//! - exclusive edit locks on shared workspace files
//! - edit fan-out to watching clients
//! - program runs streamed back over WebSocket connections

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use codeshare_broker::config::BrokerConfig;
use codeshare_broker::core::BrokerCore;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Broker command line arguments.
#[derive(Parser, Debug)]
#[command(name = "codeshare-broker")]
#[command(about = "Collaborative edit-and-run broker")]
struct Args {
	/// Config file (TOML). Defaults to $CODESHARE_CONFIG or the user config dir.
	#[arg(short, long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Address to listen on, overriding the config file
	#[arg(short, long, value_name = "ADDR")]
	bind: Option<String>,

	/// Workspace directory, overriding the config file
	#[arg(short, long, value_name = "DIR")]
	workspace: Option<PathBuf>,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	setup_tracing(args.verbose);

	info!("starting codeshare-broker");

	let mut config = load_config(args.config)?;
	if let Some(bind) = args.bind {
		config.bind = bind;
	}
	if let Some(workspace) = args.workspace {
		config.workspace = workspace;
	}

	let core = BrokerCore::new(&config)?;
	info!(workspace = %core.workspace_root().display(), policy = ?core.policy(), "workspace ready");

	let listener = tokio::net::TcpListener::bind(&config.bind).await?;

	let shutdown = CancellationToken::new();
	tokio::spawn(wait_for_signal(shutdown.clone()));

	codeshare_broker::ws::serve(listener, core.clone(), shutdown).await?;

	core.shutdown(config.session.kill_grace() + Duration::from_secs(2))
		.await;
	info!("codeshare-broker stopped");

	Ok(())
}

fn load_config(explicit: Option<PathBuf>) -> Result<BrokerConfig, Box<dyn std::error::Error>> {
	if let Some(path) = explicit {
		info!(path = %path.display(), "loading config");
		return Ok(BrokerConfig::load(&path)?);
	}

	match codeshare_proto::paths::default_config_path() {
		Some(path) if path.is_file() => {
			info!(path = %path.display(), "loading config");
			Ok(BrokerConfig::load(&path)?)
		}
		_ => Ok(BrokerConfig::default()),
	}
}

async fn wait_for_signal(shutdown: CancellationToken) {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};

		match signal(SignalKind::terminate()) {
			Ok(mut term) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => {}
					_ = term.recv() => {}
				}
			}
			Err(err) => {
				tracing::warn!(error = %err, "SIGTERM handler unavailable");
				let _ = tokio::signal::ctrl_c().await;
			}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}

	info!("shutdown signal received");
	shutdown.cancel();
}

fn setup_tracing(verbose: bool) {
	use std::fs::OpenOptions;

	use tracing_subscriber::EnvFilter;
	use tracing_subscriber::fmt::format::FmtSpan;
	use tracing_subscriber::prelude::*;

	if let Some(log_dir) = std::env::var("CODESHARE_LOG_DIR").ok().map(PathBuf::from)
		&& std::fs::create_dir_all(&log_dir).is_ok()
	{
		let pid = std::process::id();
		let log_path = log_dir.join(format!("codeshare-broker.{}.log", pid));

		if let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) {
			let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
				if verbose {
					EnvFilter::new("codeshare_broker=trace,debug")
				} else {
					EnvFilter::new("codeshare_broker=debug,info")
				}
			});

			let file_layer = tracing_subscriber::fmt::layer()
				.with_writer(file)
				.with_ansi(false)
				.with_span_events(FmtSpan::CLOSE)
				.with_target(true);

			tracing_subscriber::registry()
				.with(filter)
				.with(file_layer)
				.init();

			tracing::info!(path = ?log_path, "Broker tracing initialized");
			return;
		}
	}

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
		EnvFilter::new(if verbose { "debug" } else { "info" })
	});
	tracing_subscriber::fmt().with_env_filter(filter).init();
}
