//! Dashbot CLI entry point.

use anyhow::Context as _;
use clap::Parser;
use dashbot::config::Config;
use dashbot::llm::{Completer, OpenAiClient};
use dashbot::media::MediaNormalizer;
use dashbot::session::SessionDeps;
use dashbot::store::SqliteStore;
use dashbot::stt::WhisperApi;
use dashbot::supervisor::{Supervisor, TelegramSessionFactory};

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "dashbot")]
#[command(about = "Runs one AI-assistant Telegram bot per active dashboard messenger")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    let _log_guard = dashbot::daemon::init_tracing(&config.log_dir, cli.debug)?;
    tracing::info!(log_dir = %config.log_dir.display(), "starting dashbot");

    let store = Arc::new(
        SqliteStore::connect(&config.database_url)
            .await
            .context("failed to open conversation store")?,
    );
    tracing::info!("conversation store ready");

    let completion = OpenAiClient::new(&config.completion, config.api_key())
        .context("failed to build completion client")?;
    let transcriber = WhisperApi::new(
        completion.http_client().clone(),
        completion.base_url(),
        completion.api_key(),
        config.media.transcription_model.clone(),
    );

    let deps = SessionDeps {
        store: store.clone(),
        completer: Completer::new(Arc::new(completion), store.clone()),
        media: Arc::new(MediaNormalizer::new(
            Arc::new(transcriber),
            config.media.clone(),
        )),
        config: config.session,
        shutdown_grace: config.supervisor.shutdown_grace(),
    };

    let mut supervisor = Supervisor::new(
        store.clone(),
        Box::new(TelegramSessionFactory::new(deps)),
        config.supervisor,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        dashbot::daemon::shutdown_signal().await;
        shutdown_tx.send(true).ok();
    });

    supervisor.run(shutdown_rx).await;

    store.close().await;
    tracing::info!("dashbot stopped");
    Ok(())
}
