use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use chunkvault::client::{HttpTransport, JsonFilePersistence, UploadEvent, UploadScheduler};
use chunkvault::codec::LocalFile;
use chunkvault::config::{Config, DEFAULT_CONFIG_PATH};
use chunkvault::server::{router, spawn_recovery, Assembler, FsBlobStore, MemoryMetadataStore, SessionStore, TempStore};
use chunkvault::types::{OwnerId, UploadKind};
use chunkvault::utils::format_progress;

#[derive(Parser, Debug)]
#[command(name = "chunkvault", version, about = "Resumable chunked uploads")]
struct Cli {
    #[arg(long, global = true, env = "CHUNKVAULT_CONFIG", default_value = DEFAULT_CONFIG_PATH, help = "Config file path")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the upload server
    Serve,
    /// Upload one file to the configured server
    Upload {
        file: PathBuf,
        #[arg(long, help = "Also create a video record")]
        video: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level)))
        .init();

    match cli.command {
        Command::Serve => serve(&config).await,
        Command::Upload { file, video } => {
            let kind = if video { UploadKind::Video } else { UploadKind::File };
            upload(&config, &file, kind).await
        }
    }
}

async fn serve(config: &Config) -> anyhow::Result<()> {
    let temp = TempStore::open(&config.server.temp_dir)
        .await
        .context("opening temp store")?;
    let blobs = Arc::new(FsBlobStore::new(&config.server.blob_dir, &config.server.public_base_url));
    let assembler = Assembler::new(temp.clone(), blobs, Arc::new(MemoryMetadataStore::new()));
    let store = Arc::new(
        SessionStore::open(config.server.store.clone(), temp, assembler)
            .await
            .context("restoring upload sessions")?,
    );

    let shutdown = CancellationToken::new();
    let expiry = store.clone().spawn_expiry_task(shutdown.clone());
    let recovery = spawn_recovery(store.clone(), config.server.recovery_warmup);

    let mut created = store.subscribe();
    tokio::spawn(async move {
        loop {
            match created.recv().await {
                Ok(file) => tracing::info!(
                    owner = %file.owner_id,
                    file_id = %file.file_id,
                    key = %file.key,
                    size = file.size,
                    "file created"
                ),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "file events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    tracing::info!(addr = %listener.local_addr()?, version = env!("CARGO_PKG_VERSION"), "chunkvault server listening");

    axum::serve(listener, router(store))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("http server")?;

    shutdown.cancel();
    let _ = expiry.await;
    recovery.abort();
    Ok(())
}

async fn upload(config: &Config, path: &Path, kind: UploadKind) -> anyhow::Result<()> {
    let file = LocalFile::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let transport = HttpTransport::new(
        &config.client.server_url,
        OwnerId::new(config.client.owner_id.clone()),
        config.client.request_timeout,
    )?
    .with_retry(config.client.request_retry());
    let persistence = JsonFilePersistence::open(&config.client.state_dir)
        .await
        .context("opening client state")?;

    let handle = UploadScheduler::new(
        Arc::new(transport),
        Arc::new(persistence),
        config.client.to_scheduler_config(),
    );
    let scheduler = handle.scheduler.clone();
    let mut events = scheduler.subscribe_events();

    let token = scheduler
        .start_upload(Arc::new(file), kind, HashMap::new())
        .await
        .with_context(|| format!("starting upload of {}", path.display()))?;
    tracing::info!(%token, "upload started");

    let failure = loop {
        match events.recv().await {
            Ok(UploadEvent::Progress(progress)) if progress.token == token => {
                println!(
                    "{}",
                    format_progress(progress.fraction, progress.bytes_per_second, progress.eta)
                );
            }
            Ok(UploadEvent::Completed { token: done, outcome }) if done == token => {
                println!("uploaded {}: {}", path.display(), outcome.url);
                break None;
            }
            Ok(UploadEvent::Failed { token: failed, error }) if failed == token => break Some(error),
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break Some("scheduler stopped".to_string()),
        }
    };

    handle.shutdown().await?;
    if let Some(error) = failure {
        bail!("upload {token} failed: {error}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["chunkvault", "serve"]).unwrap();
        assert!(matches!(cli.command, Command::Serve));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));

        let cli = Cli::try_parse_from(["chunkvault", "upload", "clip.mp4", "--video", "--config", "alt.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
        match cli.command {
            Command::Upload { file, video } => {
                assert_eq!(file, PathBuf::from("clip.mp4"));
                assert!(video);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_incomplete_arguments() {
        assert!(Cli::try_parse_from(["chunkvault"]).is_err());
        assert!(Cli::try_parse_from(["chunkvault", "upload", "--video"]).is_err());
        assert!(Cli::try_parse_from(["chunkvault", "serve", "--config"]).is_err());
        assert!(Cli::try_parse_from(["chunkvault", "download"]).is_err());
    }
}
