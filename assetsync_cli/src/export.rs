use std::{path::PathBuf, time::Instant};

use anyhow::anyhow;
use assetsync_core::config::SyncConfig;
use clap::Args;
use colored::Colorize;
use log::info;
use tokio_util::sync::CancellationToken;

/// Export a directory of processed output to the CDN
#[derive(Args, Debug)]
pub struct ExportCommand {
    /// Directory to export; files keep their relative paths
    directory: PathBuf,

    /// Project prefix for remote paths, instead of the configured project
    #[arg(short = 'p', long)]
    project: Option<String>,
}

impl ExportCommand {
    pub async fn run(&self, config: SyncConfig, ct: &CancellationToken) -> anyhow::Result<()> {
        if !self.directory.is_dir() {
            return Err(anyhow!("{} is not a directory", self.directory.to_string_lossy()));
        }
        let project_name = match &self.project {
            Some(project) => project.clone(),
            None => config.require_project()?.to_string(),
        };

        let coordinator = crate::open_coordinator(&config).await?;
        info!(
            "Exporting {} to {}/...",
            self.directory.to_string_lossy().blue(),
            project_name.blue()
        );

        let instant = Instant::now();
        let outcome = coordinator
            .export_directory(&self.directory, &project_name, ct)
            .await?;

        let summary = format!(
            "{} files: {} uploaded, {} unchanged, {} failed",
            outcome.total, outcome.uploaded_count, outcome.skipped_count, outcome.failed_count
        );
        if outcome.success {
            info!(
                "{} {} in {:.2}s",
                "SUCCESS!".green(),
                summary,
                instant.elapsed().as_secs_f32()
            );
            Ok(())
        } else {
            Err(anyhow!("Export incomplete: {}", summary))
        }
    }
}
