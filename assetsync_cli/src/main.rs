use assetsync_core::{
    config::SyncConfig,
    events::EventBus,
    transfer::{B2Client, TransferStateStore, UploadCoordinator},
};
use clap::{Parser, Subcommand};
use delete::DeleteCommand;
use export::ExportCommand;
use history::HistoryCommand;
use log::warn;
use tokio_util::sync::CancellationToken;
use upload::UploadCommand;

mod delete;
mod export;
mod history;
mod upload;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Upload(UploadCommand),
    Export(ExportCommand),
    History(HistoryCommand),
    Delete(DeleteCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    pretty_env_logger::init();

    let args = Args::parse();
    let config = SyncConfig::load()?;

    let ct = CancellationToken::new();
    let ctrl_c = ct.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping uploads...");
            ctrl_c.cancel();
        }
    });

    match args.commands {
        Commands::Upload(upload) => upload.run(config, &ct).await,
        Commands::Export(export) => export.run(config, &ct).await,
        Commands::History(history) => history.run(config).await,
        Commands::Delete(delete) => delete.run(config).await,
    }
}

/// CDN client with the configured retry policy, authorized up front so bad
/// credentials fail before any file is hashed.
pub async fn connect_cdn(config: &SyncConfig) -> anyhow::Result<B2Client> {
    use assetsync_core::transfer::CdnStore;

    let store = B2Client::new(config.require_cdn()?.clone()).with_retry(config.file_retry);
    store.authorize().await?;
    Ok(store)
}

pub async fn open_coordinator(config: &SyncConfig) -> anyhow::Result<UploadCoordinator<B2Client>> {
    let store = connect_cdn(config).await?;
    let ledger = TransferStateStore::open(&config.ledger_path).await?;
    Ok(UploadCoordinator::new(store, EventBus::default())
        .with_ledger(ledger)
        .with_concurrency(config.upload_concurrency))
}
