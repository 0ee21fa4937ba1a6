use anyhow::anyhow;
use assetsync_core::{config::SyncConfig, transfer::CdnStore};
use clap::Args;
use colored::Colorize;
use log::info;

/// Delete every stored version of a file from the CDN
#[derive(Args, Debug)]
pub struct DeleteCommand {
    /// Remote path, e.g. Racer/textures/sky.png
    remote_path: String,
}

impl DeleteCommand {
    pub async fn run(&self, config: SyncConfig) -> anyhow::Result<()> {
        let store = crate::connect_cdn(&config).await?;
        if store.delete_file(&self.remote_path).await {
            info!("[{}] {} deleted", "-".red(), self.remote_path.red());
            Ok(())
        } else {
            Err(anyhow!("Nothing deleted at {}", self.remote_path))
        }
    }
}
