// src/main.rs

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gateway_transfer::prelude::*;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gateway-transfer", version, about = "Resumable chunked transfers over HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download a resource in ranged chunks, resuming from the local file size.
    Download {
        /// Address of the resource.
        url: String,
        /// Output file.
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Upload a file to the gateway in chunks.
    Upload {
        /// File to upload.
        file: PathBuf,
        /// Gateway base address.
        #[arg(short, long, env = "GATEWAY_URL")]
        gateway: String,
        /// Abort after this many gateway offset corrections.
        #[arg(long)]
        max_resyncs: Option<u32>,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Exchange account credentials for an authorization token.
    Token {
        #[arg(short, long, env = "GATEWAY_URL")]
        gateway: String,
        #[arg(long)]
        account: String,
        #[arg(long, env = "GATEWAY_API_KEY", hide_env_values = true)]
        api_key: String,
        /// Requested token lifetime.
        #[arg(long, default_value_t = 3600)]
        expire_time: i64,
    },
    /// Stream a whole resource to stdout.
    Cat {
        url: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
}

#[derive(Debug, Args)]
struct TransferArgs {
    /// Chunk size in bytes; 0 selects the default.
    #[arg(long, env = "GATEWAY_CHUNK_SIZE", default_value_t = 0)]
    chunk_size: u64,
    /// Deadline for the whole transfer in seconds; 0 selects the default.
    #[arg(long, default_value_t = 0)]
    timeout: u64,
    /// Retries per chunk after the first attempt.
    #[arg(long)]
    retries: Option<u32>,
    #[arg(long, env = "GATEWAY_AUTH_TOKEN", default_value = "", hide_env_values = true)]
    token: String,
}

impl TransferArgs {
    fn into_config(self, url: String, path: PathBuf) -> TransferConfig {
        let mut config = TransferConfig::new(url, path)
            .with_chunk_size(self.chunk_size)
            .with_timeout(Duration::from_secs(self.timeout))
            .with_auth_token(self.token);
        config.max_retries = self.retries;
        config
    }
}

fn progress(label: &'static str) -> ProgressCallback {
    Box::new(move |done: u64, total: u64| {
        let percent = if total == 0 {
            100.0
        } else {
            done as f64 * 100.0 / total as f64
        };
        tracing::info!(done, total, "{label} {percent:.1}%");
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Download {
            url,
            output,
            transfer,
        } => {
            let config = transfer.into_config(url, output.clone());
            let report = Downloader::new(config)?
                .on_progress(progress("downloaded"))
                .run()
                .await
                .with_context(|| format!("failed to download into {}", output.display()))?;
            tracing::info!(
                size = report.total_size,
                resumed_from = report.resumed_from,
                chunks = report.chunks_fetched,
                "download finished"
            );
        }
        Command::Upload {
            file,
            gateway,
            max_resyncs,
            transfer,
        } => {
            let mut config = transfer.into_config(gateway, file.clone());
            config.max_resyncs = max_resyncs;
            let report = Uploader::new(config)?
                .on_progress(progress("acknowledged"))
                .run()
                .await
                .with_context(|| format!("failed to upload {}", file.display()))?;
            tracing::info!(resyncs = report.resyncs, md5 = %report.file_md5, "upload finished");
            println!("{}", report.id);
        }
        Command::Token {
            gateway,
            account,
            api_key,
            expire_time,
        } => {
            let credentials = TokenRequest {
                account,
                api_key,
                expire_time,
            };
            let token = create_token(&HttpTransport::new()?, &gateway, &credentials)
                .await
                .context("failed to create token")?;
            println!("{token}");
        }
        Command::Cat { url, transfer } => {
            let config = transfer.into_config(url.clone(), PathBuf::from("-"));
            let stream = open_stream(&HttpTransport::new()?, &config)
                .await
                .with_context(|| format!("failed to open {url}"))?;
            let mut stdout = tokio::io::stdout();
            let copied = stream.copy_to(&mut stdout).await?;
            tracing::debug!(copied, "stream written to stdout");
        }
    }

    Ok(())
}
