use std::time::Instant;

use anyhow::anyhow;
use assetsync_core::{config::SyncConfig, manifest::store, ResourceStatus};
use clap::Args;
use colored::Colorize;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

/// Upload the project's local files to the CDN
#[derive(Args, Debug)]
pub struct UploadCommand {
    /// Project to upload, instead of the configured one
    #[arg(short = 'p', long)]
    project: Option<String>,

    /// Model the files belong to; they are stored under {project}/{model}/
    #[arg(short = 'm', long)]
    model: Option<String>,
}

impl UploadCommand {
    pub async fn run(&self, mut config: SyncConfig, ct: &CancellationToken) -> anyhow::Result<()> {
        if let Some(project) = &self.project {
            config.project_name = Some(project.clone());
        }
        let project_name = config.require_project()?.to_string();

        let cache_path = store::cache_path(&config.projects_root, &project_name);
        let manifest = store::load(&cache_path).await?.ok_or_else(|| {
            anyhow!(
                "No manifest cached at {}, pull the project first",
                cache_path.to_string_lossy()
            )
        })?;
        let (mut resources, _) =
            manifest.resources(config.require_api_url()?, &project_name, &config.projects_root);

        let coordinator = crate::open_coordinator(&config).await?;
        let restored = coordinator.restore_from_ledger(&mut resources).await;
        info!(
            "CDN authorization successful! {} of {} resources have upload history",
            restored,
            resources.len()
        );

        let instant = Instant::now();
        let outcome = coordinator
            .upload_resources(&mut resources, &project_name, self.model.as_deref(), ct)
            .await?;

        for resource in resources.iter().filter(|x| x.status == ResourceStatus::UploadFailed) {
            warn!("[{}] {} failed to upload", "x".red(), resource.name.red());
        }
        let summary = format!(
            "{} uploaded, {} unchanged, {} failed",
            outcome.uploaded_count, outcome.skipped_count, outcome.failed_count
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
            Err(anyhow!("Upload incomplete: {}", summary))
        }
    }
}
