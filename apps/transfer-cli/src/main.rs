//! `tessera`: moves files into and out of a local storage root through the
//! block transfer engine.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tessera_protocol::{AbortReason, TransferStatus};
use tessera_transfer::{
    DownloadRequest, LocalFileProvider, TokioScheduler, TransferConfig, TransferHandler,
    UploadRequest, checksum_reader,
};
use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tessera", version, about, long_about = None)]
struct Cli {
    /// Storage root that resource ids are relative to
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    root: PathBuf,

    /// JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Block size in bytes, overriding the configuration
    #[arg(short, long, value_name = "BYTES")]
    block_size: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Copy a local file into the storage root
    Upload {
        /// File to read
        source: PathBuf,

        /// Target resource id
        resource: String,

        /// Replace an existing resource
        #[arg(long)]
        overwrite: bool,

        /// Compare content hashes after the upload
        #[arg(long)]
        verify: bool,
    },

    /// Copy a resource out of the storage root
    Download {
        /// Resource id to read
        resource: String,

        /// File to write
        destination: PathBuf,

        /// Compare content hashes after the download
        #[arg(long)]
        verify: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tessera=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.block_size)?;
    let handler = build_handler(cli.root.clone(), config);
    let sweeper = handler.spawn_lock_sweeper(&Handle::current());

    let command = cli.command;
    let result = tokio::task::spawn_blocking(move || run(&handler, command))
        .await
        .context("transfer task failed")?;
    sweeper.cancel();
    result
}

fn load_config(path: Option<&Path>, block_size: Option<u64>) -> Result<TransferConfig> {
    let mut config = match path {
        Some(path) => TransferConfig::load(path)?,
        None => TransferConfig::default(),
    };
    if let Some(size) = block_size {
        config.max_block_size = size;
        config.download_block_size = size;
    }
    Ok(config.clamped())
}

/// Must be called inside a tokio runtime.
fn build_handler(root: PathBuf, config: TransferConfig) -> TransferHandler {
    TransferHandler::builder(
        Arc::new(LocalFileProvider::new(root)),
        Arc::new(TokioScheduler::new(Handle::current())),
    )
    .config(config)
    .build()
}

fn run(handler: &TransferHandler, command: Command) -> Result<()> {
    match command {
        Command::Upload {
            source,
            resource,
            overwrite,
            verify,
        } => upload(handler, &source, &resource, overwrite, verify),
        Command::Download {
            resource,
            destination,
            verify,
        } => download(handler, &resource, &destination, verify),
    }
}

fn upload(
    handler: &TransferHandler,
    source: &Path,
    resource: &str,
    overwrite: bool,
    verify: bool,
) -> Result<()> {
    let started = Instant::now();
    let file = File::open(source).with_context(|| format!("failed to open {}", source.display()))?;
    let length = file.metadata()?.len();

    let token =
        handler.request_upload_token(UploadRequest::new(resource, length).overwrite(overwrite))?;
    let transfer_id = token.transfer.transfer_id.clone();
    info!(
        transfer = %transfer_id,
        resource = %token.transfer.resource_id,
        length,
        "uploading"
    );

    // Flushing the writer sends the last block, which completes the upload.
    let mut writer = handler.upload_writer(&token);
    let copied = io::copy(&mut BufReader::new(file), &mut writer)
        .and_then(|n| writer.flush().map(|()| n));
    let copied = match copied {
        Ok(n) => n,
        Err(err) => {
            handler.cancel(&transfer_id, AbortReason::ClientAbort);
            return Err(err).context("upload failed");
        }
    };

    if verify {
        let expected = checksum_reader(&mut File::open(source)?)?;
        match handler
            .complete(&transfer_id, Some(&expected))
            .context("upload verification failed")?
        {
            TransferStatus::Completed => info!(hash = %expected, "upload verified"),
            status => bail!("upload {transfer_id} could not be verified, status {status:?}"),
        }
    }

    info!(
        transfer = %transfer_id,
        bytes = copied,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "upload complete"
    );
    Ok(())
}

fn download(
    handler: &TransferHandler,
    resource: &str,
    destination: &Path,
    verify: bool,
) -> Result<()> {
    let started = Instant::now();
    let token =
        handler.request_download_token(DownloadRequest::new(resource).include_hash(verify))?;
    let transfer_id = token.transfer.transfer_id.clone();
    info!(
        transfer = %transfer_id,
        resource = %token.transfer.resource_id,
        length = token.transfer.resource_length,
        blocks = token.total_block_count.unwrap_or(0),
        "downloading"
    );

    let file = match File::create(destination) {
        Ok(file) => file,
        Err(err) => {
            handler.cancel(&transfer_id, AbortReason::ClientAbort);
            return Err(err)
                .with_context(|| format!("failed to create {}", destination.display()));
        }
    };
    let mut out = BufWriter::new(file);
    let mut reader = handler.download_reader(&token);
    let copied = io::copy(&mut reader, &mut out).and_then(|n| out.flush().map(|()| n));
    let copied = match copied {
        Ok(n) => n,
        Err(err) => {
            handler.cancel(&transfer_id, AbortReason::ClientAbort);
            return Err(err).context("download failed");
        }
    };

    if let Some(expected) = token.content_hash.as_deref() {
        let actual = checksum_reader(&mut File::open(destination)?)?;
        if !actual.eq_ignore_ascii_case(expected) {
            warn!(expected = %expected, actual = %actual, "downloaded content differs");
            bail!("downloaded content hash {actual} differs from source hash {expected}");
        }
        info!(hash = %actual, "download verified");
    }

    info!(
        transfer = %transfer_id,
        bytes = copied,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "download complete"
    );
    Ok(())
}
