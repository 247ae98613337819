//! tars-agent - state attestation agent
//!
//! Issues a birth certificate for a server once, then proves on a fixed
//! interval that the server's state still matches a signed digest.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tars_agent::{AgentConfig, AgentError, FileKeyStore, JournalGateway, DEFAULT_CONFIG_PATH};
use tars_core::{issue_birth_certificate, BirthCertificate, KeyStore, Monitor, ServerId};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tars-agent")]
#[command(about = "Birth certificates and proof-of-life for attested servers")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "TARS_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the identity and issue the birth certificate
    Birth {
        /// Replace an existing key pair and certificate
        #[arg(long)]
        force: bool,
    },

    /// Run the proof-of-life loop until interrupted
    Monitor,

    /// Check a birth certificate's signature and compare it with a live capture
    Verify {
        /// Birth certificate to check
        #[arg(long)]
        certificate: PathBuf,

        /// Re-capture this directory and compare it with the certified digest
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Write a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        output: PathBuf,

        /// Identifier of this server
        #[arg(long)]
        server_id: String,

        /// Seconds between proofs of life
        #[arg(long, default_value_t = 3600)]
        interval: u64,
    },
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("tars_agent=info,tars_core=info"),
    };
    let json = format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command {
        Commands::Birth { force } => birth(&cli.config, force).await,
        Commands::Monitor => monitor(&cli.config).await,
        Commands::Verify { certificate, root } => verify(&certificate, root.as_deref()),
        Commands::InitConfig {
            output,
            server_id,
            interval,
        } => init_config(&output, server_id, interval),
    }
}

async fn birth(config_path: &Path, force: bool) -> anyhow::Result<()> {
    let config = AgentConfig::from_file(config_path)?;
    info!(config = %config_path.display(), server_id = %config.attestation.server_id, "issuing birth certificate");

    if config.certificate_path.exists() && !force {
        return Err(AgentError::AlreadyExists(config.certificate_path.clone()))
            .context("birth certificate present, use --force to reissue");
    }
    if let Some(parent) = config.certificate_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let key_store = FileKeyStore::new(&config.key_dir).with_overwrite(force);
    let gateway = JournalGateway::new(&config.journal_path);
    let outcome = issue_birth_certificate(
        &config.attestation,
        &key_store,
        &gateway,
        &config.certificate_path,
    )
    .await?;

    println!("Birth certificate: {}", config.certificate_path.display());
    println!("  server_id:  {}", outcome.certificate.server_id);
    println!("  state_hash: {}", outcome.certificate.state_hash);
    println!("  public_key: {}", outcome.certificate.public_key);
    match outcome.receipt {
        Some(receipt) => println!("  receipt:    {receipt}"),
        None => println!("  receipt:    (publication failed, see logs)"),
    }
    Ok(())
}

async fn monitor(config_path: &Path) -> anyhow::Result<()> {
    let config = AgentConfig::from_file(config_path)?;
    let key_store = FileKeyStore::new(&config.key_dir);
    let gateway = Arc::new(JournalGateway::new(&config.journal_path));

    let monitor = match Monitor::new(&config.attestation, &key_store, gateway) {
        Ok(monitor) => monitor,
        Err(e) => {
            error!(store = %key_store.describe(), error = %e, "cannot start monitor");
            return Err(e.into());
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let stats = monitor.run(cancel).await?;
    info!(
        completed = stats.cycles_completed,
        failed = stats.cycles_failed,
        publish_failures = stats.publish_failures,
        drift_secs = stats.drift.as_secs_f64(),
        "monitor exited"
    );
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown requested");
    cancel.cancel();
}

fn verify(certificate_path: &Path, root: Option<&Path>) -> anyhow::Result<()> {
    let certificate = BirthCertificate::read_from(certificate_path)
        .with_context(|| format!("failed to read {}", certificate_path.display()))?;
    certificate.verify().context("signature check failed")?;
    println!("Signature valid for {}", certificate.server_id);

    let Some(root) = root else {
        return Ok(());
    };
    let report = certificate.verify_against_state(root)?;
    println!("State matches: {}", report.digest_hex());
    println!("  files hashed: {}", report.files_hashed);
    if !report.unreadable.is_empty() {
        println!("  unreadable:   {}", report.unreadable.len());
    }
    Ok(())
}

fn init_config(output: &Path, server_id: String, interval: u64) -> anyhow::Result<()> {
    AgentConfig::sample(ServerId::new(server_id), interval).write_new(output)?;
    println!("Wrote config to {}", output.display());
    Ok(())
}
