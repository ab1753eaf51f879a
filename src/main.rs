use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use dotenvy::dotenv;
use secure_file_ingest::config::{Compression, RunConfig};
use secure_file_ingest::infrastructure::storage::{StorageSettings, setup_client, setup_uploader};
use secure_file_ingest::models::OutcomeStatus;
use secure_file_ingest::services::fpe::LocalFpeProvider;
use secure_file_ingest::services::record_source::{
    Decryption, RecordReader, RecordSourceConfig, SchemaField,
};
use secure_file_ingest::services::source_fs::{SchemeSourceFs, SourceFs};
use secure_file_ingest::services::worker::Worker;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "secure-file-ingest",
    version,
    about = "Stream files into object storage with anonymization, encryption and compression"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Transform and upload every file under a source path.
    Ingest {
        /// JSON object of run options.
        #[arg(long)]
        options: Option<PathBuf>,
        /// Extra option as key=value; overrides the options file.
        #[arg(long = "opt", value_parser = parse_key_value)]
        overrides: Vec<(String, String)>,
        #[arg(long)]
        source: String,
        #[arg(long, default_value = "file:///")]
        host_uri: String,
        #[arg(long)]
        recursive: bool,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// Decode an uploaded object back into JSON records.
    Extract {
        #[arg(long)]
        source: PathBuf,
        /// Columns as name:type[,name:type...].
        #[arg(long)]
        schema: String,
        #[arg(long, value_enum, default_value_t = DecryptionArg::None)]
        decryption: DecryptionArg,
        #[arg(long)]
        private_key: Option<PathBuf>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long, value_enum, default_value_t = DecompressionArg::None)]
        decompression: DecompressionArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DecryptionArg {
    None,
    Pgp,
}

#[derive(Clone, Copy, ValueEnum)]
enum DecompressionArg {
    None,
    Zip,
    Gzip,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Initialize tracing with EnvFilter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "secure_file_ingest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Cli::parse().command {
        Command::Ingest {
            options,
            overrides,
            source,
            host_uri,
            recursive,
            concurrency,
        } => ingest(options, overrides, source, host_uri, recursive, concurrency).await,
        Command::Extract {
            source,
            schema,
            decryption,
            private_key,
            password,
            decompression,
        } => {
            let decryption = match decryption {
                DecryptionArg::None => Decryption::None,
                DecryptionArg::Pgp => Decryption::Pgp {
                    secret_key_path: private_key
                        .context("--private-key is required with --decryption pgp")?,
                    password,
                },
            };
            let config = RecordSourceConfig {
                decryption,
                decompression: match decompression {
                    DecompressionArg::None => Compression::None,
                    DecompressionArg::Zip => Compression::Zip,
                    DecompressionArg::Gzip => Compression::Gzip,
                },
                schema: SchemaField::parse_list(&schema)?,
            };
            extract(source, config).await
        }
    }
}

async fn ingest(
    options_path: Option<PathBuf>,
    overrides: Vec<(String, String)>,
    source: String,
    host_uri: String,
    recursive: bool,
    concurrency: usize,
) -> anyhow::Result<()> {
    info!("🚀 Starting secure file ingest...");

    let mut options: BTreeMap<String, String> = match &options_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading options {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing options {}", path.display()))?
        }
        None => BTreeMap::new(),
    };
    options.extend(overrides);

    let config = RunConfig::from_options(&options)?;
    info!(
        "🛡️  Run config: format={:?}, compression={:?}, encryption={:?}, buffer={}B, \
         destination={}/{}",
        config.file_format,
        config.compression,
        config.encryption,
        config.buffer_size,
        config.destination.bucket,
        config.destination_path
    );

    let source_fs = if host_uri.starts_with("s3://") || host_uri.starts_with("gs://") {
        let settings = StorageSettings::for_run(&config)?;
        SchemeSourceFs::with_object_store(setup_client(&settings).await)
    } else {
        SchemeSourceFs::local()
    };
    let descriptors = source_fs.list(&source, &host_uri, recursive).await?;
    info!("📂 Found {} file(s) under {}", descriptors.len(), source);

    let uploader = setup_uploader(&config).await?;
    let worker = Worker::new(&config, &LocalFpeProvider, Arc::new(source_fs), uploader)?;

    let cancel = worker.cancellation_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });

    let summary = worker.run(descriptors, concurrency).await;
    worker.shutdown()?;

    for outcome in &summary.outcomes {
        match &outcome.status {
            OutcomeStatus::Ok(report) => {
                info!("{} -> {} sha256={}", outcome.descriptor.full_path, report.key, report.sha256)
            }
            OutcomeStatus::Skipped { reason } => {
                warn!("{} skipped: {}", outcome.descriptor.full_path, reason)
            }
            OutcomeStatus::Failed { kind, message } => {
                error!("{} failed [{}]: {}", outcome.descriptor.full_path, kind, message)
            }
        }
    }

    if summary.failed > 0 {
        bail!("{} of {} file(s) failed", summary.failed, summary.outcomes.len());
    }
    info!("🛑 Ingest finished.");
    Ok(())
}

async fn extract(source: PathBuf, config: RecordSourceConfig) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut reader = RecordReader::open(&source, &config)?;
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let mut count = 0u64;
        while let Some(record) = reader.next_record()? {
            serde_json::to_writer(&mut out, &record.to_json(reader.schema()))?;
            out.write_all(b"\n")?;
            count += 1;
        }
        out.flush()?;
        info!("✅ Extracted {} record(s) from {}", count, source.display());
        Ok(())
    })
    .await?
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, cancelling the run...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, cancelling the run...");
        },
    }
}
