//! # complyd-server
//!
//! Entry point for the complyd controller and the processes it runs inside
//! scan-scoped workloads.
//!
//! - `complyd-server controller`: reconciles scans until interrupted
//! - `complyd-server result-server`: receives raw reports for one scan
//! - `complyd-server collect`: uploads one target's report and records its
//!   result artifact

use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use complyd_config::{CollectorConfig, ControllerSettings, ReceiverConfig, TlsPaths};
use complyd_core::config::RetryConfig;
use complyd_server::{collector, controller, receiver};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "complyd-server")]
#[command(about = "Result receiver and collector for complyd compliance scans")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scan controller, configured from `COMPLYD_*` variables
    Controller,
    /// Receive raw scan reports over mutual TLS
    ResultServer(ResultServerArgs),
    /// Upload a finished scan's report and record its result artifact
    Collect(CollectArgs),
}

#[derive(ClapArgs, Debug, Clone)]
struct ResultServerArgs {
    /// Root of the raw result storage
    #[arg(long, env = "COMPLYD_RS_PATH", default_value = "/reports")]
    path: PathBuf,

    /// Port to listen on
    #[arg(long, env = "COMPLYD_RS_PORT", default_value_t = 8443)]
    port: u16,

    /// Scan that owns the results
    #[arg(long, env = "COMPLYD_RS_OWNER")]
    owner: String,

    /// Current index of the scan
    #[arg(long, env = "COMPLYD_RS_SCAN_INDEX")]
    scan_index: u64,

    /// Amount of raw result directories to keep
    #[arg(long, env = "COMPLYD_RS_ROTATION", default_value_t = 3)]
    rotation: u16,

    /// Path to the server certificate (PEM format)
    #[arg(long, env = "COMPLYD_RS_TLS_CERT")]
    tls_server_cert: PathBuf,

    /// Path to the server private key (PEM format)
    #[arg(long, env = "COMPLYD_RS_TLS_KEY")]
    tls_server_key: PathBuf,

    /// Path to the CA certificate clients must chain to
    #[arg(long, env = "COMPLYD_RS_TLS_CA")]
    tls_ca: PathBuf,
}

impl From<ResultServerArgs> for ReceiverConfig {
    fn from(args: ResultServerArgs) -> Self {
        Self {
            root: args.path,
            port: args.port,
            owner: args.owner,
            scan_index: args.scan_index,
            rotation: args.rotation,
            tls: TlsPaths {
                cert: args.tls_server_cert,
                key: args.tls_server_key,
                ca: args.tls_ca,
            },
        }
    }
}

#[derive(ClapArgs, Debug, Clone)]
struct CollectArgs {
    /// The ARF report to upload
    #[arg(long)]
    arf_file: PathBuf,

    /// The XCCDF results recorded in the artifact
    #[arg(long)]
    results_file: PathBuf,

    /// The scanner's command output, recorded when it fails
    #[arg(long)]
    output_file: PathBuf,

    /// A file containing the scanner's exit code
    #[arg(long)]
    exit_code_file: PathBuf,

    /// A file containing warnings to record
    #[arg(long)]
    warnings_file: PathBuf,

    /// Artifact name, typically the pod name
    #[arg(long)]
    report_name: String,

    /// The scan that owns the artifact
    #[arg(long)]
    scan: String,

    #[arg(long, env = "COMPLYD_NAMESPACE", default_value = "complyd")]
    namespace: String,

    #[arg(long, default_value = "")]
    owner_uid: String,

    /// The node that was scanned; empty for platform scans
    #[arg(long, default_value = "")]
    source: String,

    /// Where to write the artifact record
    #[arg(long)]
    artifact_file: PathBuf,

    #[arg(long)]
    result_server_uri: String,

    #[arg(long)]
    tls_client_cert: PathBuf,

    #[arg(long)]
    tls_client_key: PathBuf,

    #[arg(long)]
    tls_ca: PathBuf,

    /// Seconds to wait for each scanner output file
    #[arg(long, env = "COMPLYD_COLLECT_TIMEOUT", default_value_t = 3600)]
    timeout: u64,
}

impl From<CollectArgs> for CollectorConfig {
    fn from(args: CollectArgs) -> Self {
        Self {
            arf_file: args.arf_file,
            results_file: args.results_file,
            output_file: args.output_file,
            exit_code_file: args.exit_code_file,
            warnings_file: args.warnings_file,
            report_name: args.report_name,
            scan: args.scan,
            namespace: args.namespace,
            owner_uid: args.owner_uid,
            source: args.source,
            artifact_file: args.artifact_file,
            result_server_uri: args.result_server_uri,
            tls: TlsPaths {
                cert: args.tls_client_cert,
                key: args.tls_client_key,
                ca: args.tls_ca,
            },
            compression_threshold: CollectorConfig::default_compression_threshold(),
            timeout: Duration::from_secs(args.timeout),
            retry: RetryConfig::default(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(err) = dotenvy::dotenv()
        && !matches!(err, dotenvy::Error::Io(_))
    {
        return Err(err).context("failed to load .env file");
    }

    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG.
                "info,controller=info,scan=info,receiver=info,collector=info,tower_http=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    match cli.command {
        Command::Controller => {
            let (config, source) =
                ControllerSettings::load_from_env().context("failed to load controller configuration")?;
            info!(source = ?source, "starting controller");
            controller::run(config, shutdown).await
        }
        Command::ResultServer(args) => receiver::run(args.into(), shutdown).await,
        Command::Collect(args) => {
            let config = CollectorConfig::from(args);
            let outcome = collector::run(&config, &shutdown)
                .await
                .with_context(|| format!("failed to collect results for {}", config.report_name))?;
            info!(
                exit_code = %outcome.exit_code,
                uploaded = outcome.uploaded,
                artifact = %outcome.artifact_file.display(),
                "collection finished"
            );
            Ok(())
        }
    }
}

/// Cancels `shutdown` on Ctrl+C or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
